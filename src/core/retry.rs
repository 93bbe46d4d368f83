use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::ports::acquirer::{AcquireError, AcquireResult};
use crate::utils::graceful_shutdown::ShutdownToken;

/// Retry rules for certificate acquisition during bootstrap.
///
/// Validation failures get a few fixed-delay retries, since they are usually propagation delays.
/// An unreachable authority gets capped exponential backoff. Rate limits, storage and protocol
/// errors are returned immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub validation_retries: u32,
    pub validation_delay: Duration,
    pub unavailable_max_retries: u32,
    pub unavailable_backoff_base: Duration,
    pub unavailable_backoff_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            validation_retries: 3,
            validation_delay: Duration::from_secs(10),
            unavailable_max_retries: 5,
            unavailable_backoff_base: Duration::from_secs(2),
            unavailable_backoff_ceiling: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the `retry`-th retry (zero-based) after the authority was unavailable.
    pub fn unavailable_backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.unavailable_backoff_base
            .saturating_mul(factor)
            .min(self.unavailable_backoff_ceiling)
    }

    /// Run `attempt` until it succeeds, a fatal error occurs, the retry budget for the error's
    /// class is spent, or `shutdown` fires.
    pub async fn run<F, Fut, T>(&self, shutdown: &mut ShutdownToken, mut attempt: F) -> AcquireResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AcquireResult<T>>,
    {
        let mut validation_retries = 0u32;
        let mut unavailable_retries = 0u32;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Err(AcquireError::Cancelled),
                result = attempt() => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match &error {
                AcquireError::ValidationFailed { .. }
                    if validation_retries < self.validation_retries =>
                {
                    validation_retries += 1;
                    self.validation_delay
                }
                AcquireError::AuthorityUnavailable(_)
                    if unavailable_retries < self.unavailable_max_retries =>
                {
                    let delay = self.unavailable_backoff(unavailable_retries);
                    unavailable_retries += 1;
                    delay
                }
                _ => return Err(error),
            };

            warn!(
                error = %error,
                kind = error.kind(),
                delay = ?delay,
                "Certificate acquisition failed, retrying"
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, abandoning certificate acquisition");
                    return Err(AcquireError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::graceful_shutdown::{GracefulShutdown, ShutdownReason};
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn validation_failed() -> AcquireError {
        AcquireError::ValidationFailed {
            hostname: "api.example.com".to_string(),
            detail: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_unavailable_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.unavailable_backoff(0), Duration::from_secs(2));
        assert_eq!(policy.unavailable_backoff(1), Duration::from_secs(4));
        assert_eq!(policy.unavailable_backoff(4), Duration::from_secs(32));
        assert_eq!(policy.unavailable_backoff(5), Duration::from_secs(60));
        assert_eq!(policy.unavailable_backoff(40), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures_retry_with_fixed_delay() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let started = tokio::time::Instant::now();
        let counter = calls.clone();
        let result = policy
            .run(&mut token, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(validation_failed())
                    } else {
                        Ok("issued")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "issued");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_retry_budget_is_bounded() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: AcquireResult<()> = RetryPolicy::default()
            .run(&mut token, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(validation_failed()) }
            })
            .await;

        assert!(matches!(result, Err(AcquireError::ValidationFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_fatal() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: AcquireResult<()> = RetryPolicy::default()
            .run(&mut token, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AcquireError::RateLimited {
                        detail: "too many certificates".to_string(),
                        retry_after: Some(Utc::now()),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(AcquireError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authority_unavailable_backs_off_then_gives_up() {
        let shutdown = GracefulShutdown::new();
        let mut token = shutdown.shutdown_token();
        let calls = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let counter = calls.clone();
        let result: AcquireResult<()> = RetryPolicy::default()
            .run(&mut token, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AcquireError::AuthorityUnavailable("503".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(AcquireError::AuthorityUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // 2 + 4 + 8 + 16 + 32 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_backoff() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let mut token = shutdown.shutdown_token();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger_shutdown(ShutdownReason::Graceful).unwrap();
        });

        let started = tokio::time::Instant::now();
        let result: AcquireResult<()> = RetryPolicy::default()
            .run(&mut token, || async { Err(validation_failed()) })
            .await;

        assert!(matches!(result, Err(AcquireError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
