//! Client side of the coordinator protocol (spec §4.1 step (a), §4.2):
//! installed as a [`CoordinatorHooks`] implementation on a [`RateLimiter`]
//! so the limiter consults the shared authoritative bucket first and only
//! falls back to its own local tokens when the daemon can't be reached.

use super::lease::LeaseGrant;
use super::lifecycle;
use super::protocol::{decode_line, encode_line, BucketIdentity, Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use xfer_utils::{emergency_rate, Scope, EMERGENCY_BURST, LEASE_HEARTBEAT_INTERVAL};

use crate::bucket::{CoordinatorHooks, HookOutcome};
use crate::RateLimiter;

/// Connects to (spawning if necessary) the per-host coordinator for
/// `app_name` and speaks the request/response protocol over a fresh
/// connection per call — the protocol is one request per connection, not
/// a persistent session (spec §6).
pub struct CoordinatorClient {
    app_name: String,
    client_id: String,
    scope: Scope,
    base_url: String,
    key_hash: String,
    /// The limiter this client falls back to when the coordinator is
    /// unreachable; reconfigured to a lease's rate/burst, or the
    /// emergency cap, as connectivity changes.
    local: Arc<RateLimiter>,
    lease: tokio::sync::Mutex<Option<LeaseGrant>>,
}

impl CoordinatorClient {
    pub fn new(
        app_name: impl Into<String>,
        client_id: impl Into<String>,
        scope: Scope,
        base_url: impl Into<String>,
        key_hash: impl Into<String>,
        local: Arc<RateLimiter>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            client_id: client_id.into(),
            scope,
            base_url: base_url.into(),
            key_hash: key_hash.into(),
            local,
            lease: tokio::sync::Mutex::new(None),
        }
    }

    fn identity(&self) -> BucketIdentity {
        BucketIdentity {
            client_id: self.client_id.clone(),
            scope: self.scope,
            base_url: self.base_url.clone(),
            key_hash: self.key_hash.clone(),
        }
    }

    async fn roundtrip(&self, request: &Request) -> anyhow::Result<Response> {
        let stream = lifecycle::connect_or_spawn(&self.app_name).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let line = encode_line(request)?;
        write_half.write_all(line.as_bytes()).await?;
        write_half.flush().await?;
        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await?;
        if response_line.is_empty() {
            anyhow::bail!("coordinator closed the connection without responding");
        }
        decode_line(&response_line)
    }

    /// Runs indefinitely, acquiring/refreshing a lease while the
    /// coordinator is unreachable and reconfiguring `local` to match. No-op
    /// once the coordinator answers `Granted`/`Wait` again — the hot
    /// [`Self::wait`] path stops calling this once direct acquires work.
    pub async fn run_fallback_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(LEASE_HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
            let needs_refresh = {
                let lease = self.lease.lock().await;
                match lease.as_ref() {
                    Some(grant) => SystemTime::now() >= grant.refresh_by(),
                    None => false,
                }
            };
            if needs_refresh {
                self.acquire_or_refresh_lease().await;
            }
        }
    }

    /// Heartbeats an already-held, still-valid lease (spec §4.2: "refresh
    /// every 30s via Heartbeat"); only mints a fresh lease via
    /// `AcquireLease` on first acquisition or once the held one has
    /// expired or been rejected (e.g. evicted server-side by the stale
    /// sweep). A heartbeat never re-splits the scope's target rate among
    /// holders the way a repeated `AcquireLease` would.
    async fn acquire_or_refresh_lease(&self) {
        let existing_lease_id = {
            let lease = self.lease.lock().await;
            lease.as_ref().filter(|grant| grant.is_valid(SystemTime::now())).map(|grant| grant.lease_id.clone())
        };

        if let Some(lease_id) = existing_lease_id {
            match self
                .roundtrip(&Request::Heartbeat { client_id: self.client_id.clone(), lease_id })
                .await
            {
                Ok(Response::Ok) => {
                    if let Some(grant) = self.lease.lock().await.as_mut() {
                        grant.issued_at = SystemTime::now();
                    }
                    return;
                }
                _ => {
                    // Heartbeat rejected or coordinator unreachable: the
                    // held lease is no longer good, fall through and
                    // acquire a fresh one below.
                }
            }
        }

        match self.roundtrip(&Request::AcquireLease(self.identity())).await {
            Ok(Response::LeaseGranted { lease }) => {
                self.local.reconfigure(lease.rate, lease.burst);
                *self.lease.lock().await = Some(lease);
            }
            _ => {
                self.fall_back_to_emergency_cap();
            }
        }
    }

    fn fall_back_to_emergency_cap(&self) {
        let hard_limit = self.scope.limits().hard_limit;
        self.local.reconfigure(emergency_rate(hard_limit), EMERGENCY_BURST);
    }
}

#[async_trait]
impl CoordinatorHooks for CoordinatorClient {
    async fn wait(&self, cancel: &CancellationToken) -> HookOutcome {
        loop {
            match self.roundtrip(&Request::Acquire(self.identity())).await {
                Ok(Response::Granted) => return HookOutcome::Granted,
                Ok(Response::Wait { wait_duration }) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait_duration) => continue,
                        _ = cancel.cancelled() => return HookOutcome::Unreachable,
                    }
                }
                Ok(_) => return HookOutcome::Unreachable,
                Err(err) => {
                    tracing::debug!(%err, "coordinator unreachable, falling back to lease/emergency cap");
                    xfer_metrics::COORDINATOR_UNREACHABLE.inc();
                    self.acquire_or_refresh_lease().await;
                    return HookOutcome::Unreachable;
                }
            }
        }
    }

    async fn drain(&self) {
        let _ = self.roundtrip(&Request::Drain(self.identity())).await;
    }

    async fn set_cooldown(&self, duration: Duration) {
        let _ = self
            .roundtrip(&Request::SetCooldown {
                identity: self.identity(),
                cooldown_duration: duration,
            })
            .await;
    }
}
