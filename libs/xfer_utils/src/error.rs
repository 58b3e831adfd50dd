//! Error taxonomy (§7). These are the kinds the orchestrator classifies
//! errors into in order to decide retry/abort/resume behaviour; they are
//! not meant to enumerate every possible underlying cause, which is why
//! most variants carry an opaque [`anyhow::Error`] payload.

use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Network timeout, 5xx, connection reset: retried with backoff.
    #[error("transient I/O error: {0}")]
    Transient(#[source] anyhow::Error),

    /// HTTP 429: bucket drained, cooldown set from `Retry-After`.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Expired/invalid credentials: one refresh-and-retry is attempted
    /// before this becomes fatal.
    #[error("authentication failed: {0}")]
    Authentication(#[source] anyhow::Error),

    /// Never retried; carries enough context for the caller to act.
    #[error("not enough free disk space at {path}: need {required_bytes}, have {available_bytes}")]
    DiskFull {
        path: Utf8PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },

    /// On-disk resume state didn't validate against the current
    /// invocation; the caller should start fresh.
    #[error("resume state invalid: {0}")]
    ResumeStateInvalid(String),

    /// The rate-limit coordinator could not be reached. Returned once by
    /// the wait-hook; the limiter then falls back to a lease or the
    /// emergency cap and the caller should treat this as transient.
    #[error("rate-limit coordinator unreachable")]
    CoordinatorUnreachable,

    /// Downloaded content's checksum didn't match the one registered at
    /// upload time. Fatal unless the caller opted into `SkipChecksum`.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: Utf8PathBuf,
        expected: String,
        actual: String,
    },

    /// Missing required metadata key or an unrecognized format version.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Transient(_) | TransferError::RateLimited { .. }
        )
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        TransferError::Transient(err.into())
    }
}
