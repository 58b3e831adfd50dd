//! Process-wide Prometheus metrics for the transfer engine.
//!
//! The core has no UI of its own (out of scope, §1), but it still needs
//! to expose counters an embedder's monitoring stack can scrape, the way
//! the teacher's `metrics` crate backs every other subsystem.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static TRANSFERS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "xfer_transfers_active",
        "Number of uploads/downloads currently in flight"
    )
    .unwrap()
});

pub static BYTES_UPLOADED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("xfer_bytes_uploaded_total", "Plaintext bytes uploaded").unwrap()
});

pub static BYTES_DOWNLOADED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("xfer_bytes_downloaded_total", "Plaintext bytes downloaded").unwrap()
});

pub static PARTS_UPLOADED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("xfer_parts_uploaded_total", "Ciphertext parts uploaded").unwrap()
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "xfer_rate_limit_waits_total",
        "Rate limiter waits by scope",
        &["scope"]
    )
    .unwrap()
});

pub static COORDINATOR_UNREACHABLE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "xfer_coordinator_unreachable_total",
        "Times the rate-limit coordinator was unreachable and the client fell back locally"
    )
    .unwrap()
});

pub static RESUME_STATE_INVALID: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "xfer_resume_state_invalid_total",
        "Times an on-disk resume state failed validation and was discarded"
    )
    .unwrap()
});

pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "xfer_retry_attempts_total",
        "Backend request retries by request kind",
        &["kind"]
    )
    .unwrap()
});
