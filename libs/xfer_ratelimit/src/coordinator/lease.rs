use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use xfer_utils::Scope;

/// A time-bounded grant from the coordinator authorising a client to run
/// a local limiter at a fractional share of a scope's rate when
/// disconnected (GLOSSARY: Lease).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease_id: String,
    pub scope: Scope,
    /// Rate allotted to this holder: the scope's target rate divided
    /// evenly by the number of active holders at grant time.
    pub rate: f64,
    pub burst: u32,
    #[serde(with = "humantime_serde")]
    pub expires_at_offset: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_by_offset: Duration,
    /// Wall-clock moment the grant was issued; offsets above are relative
    /// to this so the message stays comparable across clock skew between
    /// processes on the same host (they share a clock in practice, but we
    /// don't rely on that when reasoning about expiry locally).
    pub issued_at: SystemTime,
}

impl LeaseGrant {
    pub fn expires_at(&self) -> SystemTime {
        self.issued_at + self.expires_at_offset
    }

    pub fn refresh_by(&self) -> SystemTime {
        self.issued_at + self.refresh_by_offset
    }

    pub fn is_valid(&self, now: SystemTime) -> bool {
        now < self.expires_at()
    }
}
