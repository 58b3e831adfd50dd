//! The authoritative coordinator daemon (spec §4.2, §6): one process per
//! host owns the real [`RateLimiter`] for every bucket its clients share,
//! so a fleet of independent processes hitting the same API key sees one
//! combined rate rather than `N * limit`.

use super::lease::LeaseGrant;
use super::protocol::{decode_line, encode_line, BucketIdentity, BucketStateSnapshot, Request, Response};
use super::transport;
use crate::bucket::AcquireResult;
use crate::RateLimiter;
use camino::Utf8Path;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;
use xfer_utils::{Scope, COORDINATOR_IDLE_SHUTDOWN, COORDINATOR_SWEEP_INTERVAL, LEASE_TTL};

struct LeaseRecord {
    grant: LeaseGrant,
    client_id: String,
    bucket_key: String,
}

struct ClientRecord {
    last_seen: Instant,
}

#[derive(Default)]
struct ServerState {
    buckets: HashMap<String, Arc<RateLimiter>>,
    clients: HashMap<String, ClientRecord>,
    leases: HashMap<String, LeaseRecord>,
}

impl ServerState {
    fn bucket_for(&mut self, identity: &BucketIdentity) -> Arc<RateLimiter> {
        let key = bucket_key(identity.scope, &identity.base_url, &identity.key_hash);
        self.buckets
            .entry(key)
            .or_insert_with(|| {
                let limits = identity.scope.limits();
                Arc::new(RateLimiter::new(limits.target, limits.burst, limits.hard_limit).with_scope(identity.scope))
            })
            .clone()
    }

    fn touch_client(&mut self, client_id: &str) {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientRecord { last_seen: Instant::now() })
            .last_seen = Instant::now();
    }
}

fn bucket_key(scope: Scope, base_url: &str, key_hash: &str) -> String {
    format!("{base_url}|{key_hash}|{scope}")
}

/// Number of other live holders of leases against a bucket, used to split
/// the target rate evenly (GLOSSARY: Lease).
fn active_lease_count(state: &ServerState, bucket_key: &str, now: SystemTime) -> usize {
    state
        .leases
        .values()
        .filter(|l| l.bucket_key == bucket_key && l.grant.is_valid(now))
        .count()
}

pub struct CoordinatorServer {
    state: Mutex<ServerState>,
    /// Set by `serve_at` once a listener is up; `Request::Shutdown`
    /// signals this to make `serve_at` return, same as the idle watchdog
    /// firing (spec §4.2 coordinator lifecycle: client→server `Shutdown`).
    shutdown: Mutex<Option<tokio::sync::mpsc::Sender<()>>>,
}

impl CoordinatorServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            shutdown: Mutex::new(None),
        }
    }

    /// Binds the local endpoint for `app_name` and serves until the idle
    /// watchdog fires or a client sends `Shutdown`. Returns once the
    /// listener is closed; callers spawn this on its own task.
    pub async fn serve(self: Arc<Self>, app_name: &str) -> anyhow::Result<()> {
        let socket_path = xfer_utils::coordinator_socket_path(app_name)?;
        self.serve_at(&socket_path).await
    }

    #[cfg(unix)]
    async fn serve_at(self: Arc<Self>, socket_path: &Utf8Path) -> anyhow::Result<()> {
        let listener = transport::bind(socket_path)?;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
        *self.shutdown.lock().await = Some(shutdown_tx.clone());
        let sweeper = tokio::spawn(Self::clone(&self).sweep_loop(shutdown_tx.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let me = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = me.handle_connection(stream).await {
                            tracing::debug!(%err, "coordinator connection ended with error");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("coordinator shutting down");
                    break;
                }
            }
        }
        sweeper.abort();
        *self.shutdown.lock().await = None;
        let _ = std::fs::remove_file(socket_path);
        Ok(())
    }

    #[cfg(windows)]
    async fn serve_at(self: Arc<Self>, socket_path: &Utf8Path) -> anyhow::Result<()> {
        let pipe_name = xfer_utils::coordinator_pipe_name(socket_path.file_stem().unwrap_or("app"));
        let mut listener = transport::bind(&pipe_name)?;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
        *self.shutdown.lock().await = Some(shutdown_tx.clone());
        let sweeper = tokio::spawn(Self::clone(&self).sweep_loop(shutdown_tx.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = accepted?;
                    let me = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = me.handle_connection(stream).await {
                            tracing::debug!(%err, "coordinator connection ended with error");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("coordinator shutting down");
                    break;
                }
            }
        }
        sweeper.abort();
        *self.shutdown.lock().await = None;
        Ok(())
    }

    fn clone(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Every 30s: drop clients unseen for more than 2x the lease TTL (spec
    /// §4.2: "missed heartbeats for more than 2xTTL evict the lease and all
    /// state for the originating client"), and their leases with them.
    /// Every idle-shutdown window with no clients at all: ask `serve_at`
    /// to stop.
    async fn sweep_loop(self: Arc<Self>, shutdown: tokio::sync::mpsc::Sender<()>) {
        let mut interval = tokio::time::interval(COORDINATOR_SWEEP_INTERVAL);
        let mut last_nonempty = Instant::now();
        loop {
            interval.tick().await;
            let mut state = self.state.lock().await;
            let cutoff = Instant::now() - 2 * LEASE_TTL;
            let stale: Vec<String> = state
                .clients
                .iter()
                .filter(|(_, c)| c.last_seen < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for client_id in &stale {
                state.clients.remove(client_id);
                state.leases.retain(|_, l| &l.client_id != client_id);
            }
            if !state.clients.is_empty() {
                last_nonempty = Instant::now();
            }
            let should_shutdown = last_nonempty.elapsed() >= COORDINATOR_IDLE_SHUTDOWN;
            drop(state);
            if should_shutdown {
                let _ = shutdown.send(()).await;
                return;
            }
        }
    }

    async fn handle_connection<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(()); // client disconnected without sending anything
        }
        let request: Request = decode_line(&line)?;
        let response = self.dispatch(request).await;
        let encoded = encode_line(&response)?;
        write_half.write_all(encoded.as_bytes()).await?;
        write_half.flush().await?;
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Acquire(identity) => {
                let mut state = self.state.lock().await;
                state.touch_client(&identity.client_id);
                let bucket = state.bucket_for(&identity);
                drop(state);
                match bucket.acquire_or_wait() {
                    AcquireResult::Granted => Response::Granted,
                    AcquireResult::Wait(wait_duration) => Response::Wait { wait_duration },
                }
            }
            Request::AcquireLease(identity) => {
                let mut state = self.state.lock().await;
                state.touch_client(&identity.client_id);
                let key = bucket_key(identity.scope, &identity.base_url, &identity.key_hash);
                let limits = identity.scope.limits();
                let now = SystemTime::now();
                let holders = active_lease_count(&state, &key, now) + 1;
                let grant = LeaseGrant {
                    lease_id: Uuid::new_v4().to_string(),
                    scope: identity.scope,
                    rate: limits.target / holders as f64,
                    burst: (limits.burst / holders as u32).max(1),
                    expires_at_offset: LEASE_TTL,
                    refresh_by_offset: LEASE_TTL / 2,
                    issued_at: now,
                };
                state.leases.insert(
                    grant.lease_id.clone(),
                    LeaseRecord {
                        grant: grant.clone(),
                        client_id: identity.client_id.clone(),
                        bucket_key: key,
                    },
                );
                Response::LeaseGranted { lease: grant }
            }
            Request::Drain(identity) => {
                let mut state = self.state.lock().await;
                state.touch_client(&identity.client_id);
                let bucket = state.bucket_for(&identity);
                drop(state);
                bucket.drain().await;
                Response::Ok
            }
            Request::SetCooldown {
                identity,
                cooldown_duration,
            } => {
                let mut state = self.state.lock().await;
                state.touch_client(&identity.client_id);
                let bucket = state.bucket_for(&identity);
                drop(state);
                bucket.set_cooldown(cooldown_duration).await;
                Response::Ok
            }
            Request::Heartbeat { client_id, lease_id } => {
                let mut state = self.state.lock().await;
                state.touch_client(&client_id);
                if let Some(record) = state.leases.get_mut(&lease_id) {
                    record.grant.issued_at = SystemTime::now();
                }
                Response::Ok
            }
            Request::GetState {
                scope,
                base_url,
                key_hash,
            } => {
                let state = self.state.lock().await;
                let key = bucket_key(scope, &base_url, &key_hash);
                match state.buckets.get(&key) {
                    Some(bucket) => {
                        let (tokens, max_tokens, refill_rate, cooldown_remaining) = bucket.debug_state();
                        Response::StateData {
                            state: BucketStateSnapshot {
                                tokens,
                                max_tokens,
                                refill_rate,
                                cooldown_remaining,
                            },
                        }
                    }
                    None => Response::Error {
                        error: "unknown bucket".to_string(),
                    },
                }
            }
            Request::Shutdown => {
                let sender = self.shutdown.lock().await.clone();
                if let Some(sender) = sender {
                    let _ = sender.send(()).await;
                }
                Response::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::protocol::BucketIdentity;

    fn identity() -> BucketIdentity {
        BucketIdentity {
            client_id: "c1".into(),
            scope: Scope::User,
            base_url: "https://api.example.com".into(),
            key_hash: "abcd1234".into(),
        }
    }

    #[tokio::test]
    async fn acquire_grants_up_to_burst_then_waits() {
        let server = CoordinatorServer::new();
        let limits = Scope::User.limits();
        let mut granted = 0;
        for _ in 0..(limits.burst + 1) {
            match server.dispatch(Request::Acquire(identity())).await {
                Response::Granted => granted += 1,
                Response::Wait { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(granted, limits.burst as usize);
    }

    #[tokio::test]
    async fn two_lease_holders_split_the_target_rate() {
        let server = CoordinatorServer::new();
        let first = match server.dispatch(Request::AcquireLease(identity())).await {
            Response::LeaseGranted { lease } => lease,
            other => panic!("unexpected {other:?}"),
        };
        let second = match server.dispatch(Request::AcquireLease(identity())).await {
            Response::LeaseGranted { lease } => lease,
            other => panic!("unexpected {other:?}"),
        };
        let full_rate = Scope::User.limits().target;
        assert!(first.rate < full_rate, "first lease should be split below the full rate");
        assert!((second.rate - first.rate).abs() < 1e-9, "both holders split the rate evenly");
    }

    #[tokio::test]
    async fn get_state_on_unknown_bucket_errors() {
        let server = CoordinatorServer::new();
        let response = server
            .dispatch(Request::GetState {
                scope: Scope::User,
                base_url: "https://nope".into(),
                key_hash: "00000000".into(),
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_request_stops_serve_at() {
        let dir = camino_tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ratelimit-coordinator.sock");
        let server = Arc::new(CoordinatorServer::new());
        let server_for_serve = Arc::clone(&server);
        let spawned_path = socket_path.clone();
        let serve_handle = tokio::spawn(async move { server_for_serve.serve_at(&spawned_path).await });

        let mut stream = loop {
            match transport::connect(&socket_path, std::time::Duration::from_millis(200)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        let line = encode_line(&Request::Shutdown).unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut resp_line = String::new();
        reader.read_line(&mut resp_line).await.unwrap();
        let response: Response = decode_line(&resp_line).unwrap();
        assert!(matches!(response, Response::Ok));

        tokio::time::timeout(std::time::Duration::from_secs(2), serve_handle)
            .await
            .expect("serve_at did not exit after a Shutdown request")
            .unwrap()
            .unwrap();
    }
}
