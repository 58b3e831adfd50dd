//! Thresholds and timeouts that are fixed properties of the wire protocol
//! or the server-side quotas this client consumes, not runtime-configurable.

use std::time::Duration;

/// Server issues 15-minute tokens; we refresh well before expiry.
pub const DEFAULT_CREDENTIAL_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(15 * 60);

/// User profile / folder listing cache freshness window.
pub const PROFILE_CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resource manager (C5).
pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 32;
pub const MEMORY_PER_THREAD_BYTES: u64 = 128 * 1024 * 1024;

pub const MIN_PART_SIZE: u64 = 16 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 32 * 1024 * 1024;

/// AES block size; every non-final v2 ciphertext part must be a multiple of this.
pub const AES_BLOCK_SIZE: usize = 16;
pub const AES_256_KEY_SIZE: usize = 32;

/// Backend client (C7).
pub const DEFAULT_PART_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const RETRY_MAX_ATTEMPTS: u32 = 10;
pub const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
pub const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Progress reporting (§5, §4.6).
pub const PROGRESS_REPORT_THRESHOLD_BYTES: u64 = 1024 * 1024;
pub const PROGRESS_REPORT_MIN_INTERVAL: Duration = Duration::from_millis(10);
pub const PROGRESS_TICK_INTERVAL: Duration = Duration::from_millis(300);

/// Overall per-file ceilings (§5).
pub const TRANSFER_TIMEOUT_SMALL: Duration = Duration::from_secs(30 * 60);
pub const TRANSFER_TIMEOUT_LARGE: Duration = Duration::from_secs(2 * 60 * 60);
pub const TRANSFER_TIMEOUT_ABSOLUTE: Duration = Duration::from_secs(4 * 60 * 60);

/// Resume state persistence cadence (§4.7 step 5): every `max(5, total_parts/4)` parts.
pub fn resume_persist_every(total_parts: usize) -> usize {
    std::cmp::max(5, total_parts / 4)
}

/// Disk-space safety margin for the v0 download path (§4.7 step 4):
/// encrypted temp + decrypted output + 15%.
pub const DISK_SPACE_SAFETY_FACTOR: f64 = 2.0 * 1.15;

/// Coordinator (C3).
pub const LEASE_TTL: Duration = Duration::from_secs(60);
pub const LEASE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const COORDINATOR_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const COORDINATOR_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
pub const COORDINATOR_IDLE_SHUTDOWN: Duration = Duration::from_secs(5 * 60);
pub const COORDINATOR_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Notification hysteresis (C2).
pub const NOTIFY_ACTIVATE_UTILIZATION: f64 = 0.60;
pub const NOTIFY_DEACTIVATE_UTILIZATION: f64 = 0.50;
pub const NOTIFY_MIN_WAIT: Duration = Duration::from_millis(100);
pub const NOTIFY_COOLDOWN: Duration = Duration::from_secs(10);

/// Emergency cap (GLOSSARY): `rate = (hard_limit / 4) * 0.5`, `burst = 1`.
pub fn emergency_rate(hard_limit: f64) -> f64 {
    (hard_limit / 4.0) * 0.5
}
pub const EMERGENCY_BURST: u32 = 1;

pub const MAX_KEYS_PER_DELETE: usize = 1000;
