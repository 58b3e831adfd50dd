//! Classical token bucket (C2, spec §4.1).
//!
//! The bucket starts full at burst capacity. Each permitted request
//! consumes one token; elapsed time since `last_refill` adds
//! `elapsed * refill_rate` tokens, capped at the burst size.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use xfer_utils::{
    Scope, NOTIFY_ACTIVATE_UTILIZATION, NOTIFY_COOLDOWN, NOTIFY_DEACTIVATE_UTILIZATION,
    NOTIFY_MIN_WAIT,
};

/// Outcome of consulting an installed coordinator hook (§4.1 step (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Granted,
    /// The coordinator could not be reached; returned at most once per
    /// call so the caller falls through to the local bucket.
    Unreachable,
}

/// Bridges [`RateLimiter`] to the cross-process coordinator (C3). A
/// production caller installs [`coordinator::client::CoordinatorClient`];
/// tests can install a fake that always returns [`HookOutcome::Unreachable`]
/// to exercise the local-fallback paths deterministically.
#[async_trait]
pub trait CoordinatorHooks: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken) -> HookOutcome;
    async fn drain(&self);
    async fn set_cooldown(&self, duration: Duration);
}

struct State {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    cooldown_end: Option<Instant>,
    hysteresis_active: bool,
    last_notify: Option<Instant>,
}

pub struct RateLimiter {
    state: Mutex<State>,
    hooks: Option<Arc<dyn CoordinatorHooks>>,
    hard_limit: f64,
    scope: Option<Scope>,
}

impl RateLimiter {
    pub fn new(refill_rate: f64, burst: u32, hard_limit: f64) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                tokens: burst as f64,
                max_tokens: burst as f64,
                refill_rate,
                last_refill: now,
                cooldown_end: None,
                hysteresis_active: false,
                last_notify: None,
            }),
            hooks: None,
            hard_limit,
            scope: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn CoordinatorHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Labels this limiter's metrics with the scope it guards (GLOSSARY:
    /// Scope). Unlabelled limiters (e.g. ad hoc test instances) report
    /// under `"unknown"`.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    fn scope_label(&self) -> &'static str {
        self.scope.map_or("unknown", Scope::as_str)
    }

    fn refill_locked(state: &mut State) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.refill_rate).min(state.max_tokens);
        state.last_refill = now;
    }

    /// Non-blocking single-token consumption.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        Self::refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self) -> Duration {
        let state = self.state.lock();
        if state.refill_rate <= 0.0 {
            return Duration::from_secs(1);
        }
        let deficit = (1.0 - state.tokens).max(0.0);
        Duration::from_secs_f64(deficit / state.refill_rate)
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        match state.cooldown_end {
            Some(end) => {
                let now = Instant::now();
                if now < end {
                    Some(end - now)
                } else {
                    state.cooldown_end = None;
                    None
                }
            }
            None => None,
        }
    }

    /// Returns when a token has been consumed, following the order in
    /// spec §4.1: coordinator hook, then local cooldown, then the token
    /// loop. Cancellable at every sleep point.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if let Some(hooks) = &self.hooks {
            if hooks.wait(cancel).await == HookOutcome::Granted {
                return Ok(());
            }
            // Unreachable: fall through to local bucket.
        }

        let mut waited = false;
        while let Some(remaining) = self.cooldown_remaining() {
            waited = true;
            tracing::warn!(wait_ms = remaining.as_millis() as u64, "rate limiter cooldown wait");
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }

        let wait_start = Instant::now();
        loop {
            if self.try_acquire() {
                if waited {
                    xfer_metrics::RATE_LIMIT_WAITS.with_label_values(&[self.scope_label()]).inc();
                }
                self.maybe_notify(wait_start.elapsed());
                return Ok(());
            }
            waited = true;
            let sleep_for = self.time_until_next_token();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }

    fn maybe_notify(&self, waited: Duration) {
        let util = self.utilization();
        let mut state = self.state.lock();
        if util >= NOTIFY_ACTIVATE_UTILIZATION {
            state.hysteresis_active = true;
        } else if util < NOTIFY_DEACTIVATE_UTILIZATION {
            state.hysteresis_active = false;
        }
        if waited > NOTIFY_MIN_WAIT && state.hysteresis_active {
            let now = Instant::now();
            let should_notify = state
                .last_notify
                .map_or(true, |t| now.duration_since(t) >= NOTIFY_COOLDOWN);
            if should_notify {
                state.last_notify = Some(now);
                drop(state);
                tracing::warn!(
                    wait_ms = waited.as_millis() as u64,
                    utilization = util,
                    "rate limiter wait exceeded threshold"
                );
            }
        }
    }

    /// Sets local tokens to zero and calls the coordinator drain hook, if any.
    pub async fn drain(&self) {
        {
            let mut state = self.state.lock();
            state.tokens = 0.0;
        }
        if let Some(hooks) = &self.hooks {
            hooks.drain().await;
        }
    }

    /// Extends the local cooldown end by `max(current, now + duration)` —
    /// merge semantics, never shortening an active cooldown (testable
    /// property 4). Also notifies the coordinator hook, which applies the
    /// same merge rule server-side.
    pub async fn set_cooldown(&self, duration: Duration) {
        let candidate = Instant::now() + duration;
        {
            let mut state = self.state.lock();
            state.cooldown_end = Some(match state.cooldown_end {
                Some(existing) => existing.max(candidate),
                None => candidate,
            });
        }
        if let Some(hooks) = &self.hooks {
            hooks.set_cooldown(duration).await;
        }
    }

    /// Atomically replaces rate and burst, capping current tokens at the
    /// new burst. Used when transitioning full <-> lease <-> emergency cap.
    pub fn reconfigure(&self, refill_rate: f64, burst: u32) {
        let mut state = self.state.lock();
        state.refill_rate = refill_rate;
        state.max_tokens = burst as f64;
        state.tokens = state.tokens.min(state.max_tokens);
    }

    pub fn utilization(&self) -> f64 {
        let state = self.state.lock();
        if self.hard_limit > 0.0 {
            state.refill_rate / self.hard_limit
        } else {
            0.0
        }
    }

    /// Non-blocking probe used by the coordinator server: acquires if a
    /// token (and no active cooldown) is available, otherwise reports how
    /// long the caller should wait before asking again.
    pub fn acquire_or_wait(&self) -> AcquireResult {
        if let Some(remaining) = self.cooldown_remaining() {
            return AcquireResult::Wait(remaining);
        }
        if self.try_acquire() {
            AcquireResult::Granted
        } else {
            AcquireResult::Wait(self.time_until_next_token())
        }
    }

    /// Raw fields for a point-in-time snapshot (§6 `GetState`).
    pub fn debug_state(&self) -> (f64, f64, f64, Option<Duration>) {
        let cooldown = self.cooldown_remaining();
        let state = self.state.lock();
        (state.tokens, state.max_tokens, state.refill_rate, cooldown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireResult {
    Granted,
    Wait(Duration),
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_drains_burst_then_fails() {
        let limiter = RateLimiter::new(1.0, 3, 10.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn refill_adds_tokens_over_time() {
        let limiter = RateLimiter::new(1000.0, 1, 10.0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn cooldown_merge_never_shortens() {
        let limiter = RateLimiter::new(1.0, 1, 10.0);
        limiter.set_cooldown(Duration::from_millis(200)).await;
        let first_end = limiter.state.lock().cooldown_end.unwrap();

        // A shorter cooldown issued later must not shrink the effective end.
        limiter.set_cooldown(Duration::from_millis(1)).await;
        let second_end = limiter.state.lock().cooldown_end.unwrap();
        assert!(second_end >= first_end);
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let limiter = RateLimiter::new(0.001, 0, 10.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.wait(&cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reconfigure_caps_tokens_at_new_burst() {
        let limiter = RateLimiter::new(1.0, 10, 10.0);
        limiter.reconfigure(0.5, 2);
        assert!(limiter.state.lock().tokens <= 2.0);
    }
}
