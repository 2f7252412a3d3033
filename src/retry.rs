use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::connectivity::Connectivity;
use crate::error::PipelineError;

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `min(initial * factor^attempt, max_delay)` for a zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// Transient failures are retried after a backoff delay (or the server's
/// `Retry-After` hint); fatal failures and loss of connectivity end the loop
/// on the spot. Attempts are strictly sequential.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    connectivity: Arc<dyn Connectivity>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            policy,
            connectivity,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if !self.connectivity.is_online() {
                return Err(PipelineError::Offline);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if !err.is_transient() {
                tracing::debug!(operation, reason = err.reason(), "Not retrying fatal error");
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(operation, attempts = attempt, "Giving up: {}", err);
                return Err(PipelineError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.policy.delay_for(attempt - 1));
            tracing::info!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed ({}), retrying",
                err
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::{AlwaysOnline, ConnectivityFlag};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor(max_attempts: u32) -> RetryExecutor {
        let policy = RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        };
        RetryExecutor::new(policy, Arc::new(AlwaysOnline))
    }

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(200), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = executor(4)
            .run("info", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipelineError::Network("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_stops_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = executor(4)
            .run("info", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Timeout("slow".into()))
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        match result {
            Err(PipelineError::Exhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source.reason(), "timeout");
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = executor(4)
            .run("info", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Upstream {
                    status: 404,
                    message: "gone".into(),
                })
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().reason(), "upstream_rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_backoff() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let result = executor(3)
            .run("info", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PipelineError::RateLimited {
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_accumulate() {
        let start = Instant::now();
        let _: Result<(), _> = executor(3)
            .run("info", move || async move { Err(PipelineError::Network("down".into())) })
            .await;
        // 1s after the first failure, 2s after the second, none after the last.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_short_circuits_remaining_attempts() {
        let flag = ConnectivityFlag::new(true);
        let retry = RetryExecutor::new(RetryPolicy::default(), Arc::new(flag.clone()));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let flag = &flag;

        let result: Result<(), _> = retry
            .run("info", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                flag.set_online(false);
                async { Err(PipelineError::Network("dropped".into())) }
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PipelineError::Offline)));
    }
}
