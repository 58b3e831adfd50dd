//! `RetryWithBackoff` (C7, spec §4.6, §7): exponential backoff with
//! jitter, up to 10 attempts; authentication errors trigger one
//! refresh-and-retry that doesn't consume the retry budget; 429s drain
//! the caller's rate limiter and set its cooldown from `Retry-After`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use xfer_utils::{TransferError, RETRY_INITIAL_BACKOFF, RETRY_MAX_ATTEMPTS, RETRY_MAX_BACKOFF};

/// Hooks the retrier calls out to on classified failures — installed by
/// the orchestrator so this crate doesn't need to depend on
/// `xfer_ratelimit` directly. Both are best-effort: a hook failing
/// doesn't abort the retry loop.
#[async_trait::async_trait]
pub trait RetryHooks: Send + Sync {
    /// Called once, before the retry, on `TransferError::Authentication`.
    async fn refresh_credentials(&self) -> anyhow::Result<()>;
    /// Called on `TransferError::RateLimited`.
    async fn on_rate_limited(&self, retry_after: Option<Duration>);
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let base = RETRY_INITIAL_BACKOFF.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = base.min(RETRY_MAX_BACKOFF.as_millis() as u64);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped / 4 + 1);
    Duration::from_millis(capped.saturating_sub(capped / 8).saturating_add(jitter_ms))
}

/// Runs `op` until it succeeds, a non-retryable error surfaces, or the
/// attempt budget is exhausted. `op` is expected to have already
/// classified its failure into a [`TransferError`] variant; this
/// function decides whether/how to retry based on that classification.
pub async fn retry_with_backoff<T, F, Fut>(
    op_name: &str,
    hooks: &dyn RetryHooks,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut auth_retry_used = false;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(TransferError::Authentication(err)) if !auth_retry_used => {
                tracing::warn!(op = op_name, %err, "credentials expired, refreshing and retrying once");
                auth_retry_used = true;
                if let Err(refresh_err) = hooks.refresh_credentials().await {
                    return Err(TransferError::Authentication(refresh_err));
                }
                // Does not consume the retry budget (spec §4.6).
                continue;
            }
            Err(TransferError::Authentication(err)) => {
                return Err(TransferError::Authentication(err));
            }
            Err(TransferError::RateLimited { retry_after }) => {
                hooks.on_rate_limited(retry_after).await;
                if attempt >= RETRY_MAX_ATTEMPTS {
                    return Err(TransferError::RateLimited { retry_after });
                }
                attempt += 1;
                xfer_metrics::RETRY_ATTEMPTS.with_label_values(&[op_name]).inc();
                tokio::time::sleep(backoff_for_attempt(attempt)).await;
            }
            Err(TransferError::Transient(err)) => {
                if attempt >= RETRY_MAX_ATTEMPTS {
                    return Err(TransferError::Transient(err));
                }
                let sleep_for = backoff_for_attempt(attempt);
                tracing::debug!(op = op_name, attempt, ?sleep_for, %err, "retrying after transient error");
                attempt += 1;
                xfer_metrics::RETRY_ATTEMPTS.with_label_values(&[op_name]).inc();
                tokio::time::sleep(sleep_for).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopHooks {
        refresh_calls: AtomicU32,
        rate_limited_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl RetryHooks for NoopHooks {
        async fn refresh_credentials(&self) -> anyhow::Result<()> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_rate_limited(&self, _retry_after: Option<Duration>) {
            self.rate_limited_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hooks() -> NoopHooks {
        NoopHooks {
            refresh_calls: AtomicU32::new(0),
            rate_limited_calls: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let hooks = hooks();
        let result = retry_with_backoff("op", &hooks, || async { Ok::<_, TransferError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_success() {
        let hooks = hooks();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff("op", &hooks, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(TransferError::transient(anyhow::anyhow!("boom")))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn authentication_error_retries_exactly_once_without_budget() {
        let hooks = hooks();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff("op", &hooks, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(TransferError::Authentication(anyhow::anyhow!("expired"))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2); // original + one retry
        assert_eq!(hooks.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disk_full_is_never_retried() {
        let hooks = hooks();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff("op", &hooks, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<u32, _>(TransferError::DiskFull {
                    path: "/tmp/x".into(),
                    required_bytes: 10,
                    available_bytes: 1,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
