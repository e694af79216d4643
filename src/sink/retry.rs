//! Retry Execution
//!
//! Wraps a remote call and repeats it while it fails with
//! [`RemoteError::Retriable`], waiting an exponentially growing, jittered
//! delay between attempts. A fatal error, an exhausted attempt budget or an
//! exceeded time budget ends the loop with [`SinkError::Remote`].
//!
//! Callers must only wrap idempotent calls: every sink operation targets a
//! fixed object name with fixed content, so repeating it converges to the
//! same store state.

use crate::sink::config::RetryConfig;
use crate::sink::error::{Operation, RemoteError, SinkError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Attempt budget and backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Each delay is spread uniformly by ±`jitter_factor` of itself
    pub jitter_factor: f64,
    /// Stop retrying once the next wait would end past this budget
    pub max_total_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            max_total_duration: config.max_total_duration,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries (startup verification)
    pub fn single_attempt() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// `max_attempts` attempts with no waiting in between
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            max_total_duration: None,
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-indexed)
    ///
    /// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay after the `attempt`-th failure, never above `max_delay`
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_factor;
        let jittered = base.as_secs_f64() + rng.gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }
}

/// Runs remote calls under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryExecutor { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `call` until it succeeds, fails fatally or the budget runs out
    pub async fn run<T, F, Fut>(
        &self,
        operation: Operation,
        object: &str,
        mut call: F,
    ) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%operation, object, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_retriable() && attempt < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempt, &mut rand::thread_rng());
                let over_budget = self
                    .policy
                    .max_total_duration
                    .is_some_and(|limit| started.elapsed() + delay > limit);

                if !over_budget {
                    warn!(
                        %operation,
                        object,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after retriable failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
                warn!(%operation, object, attempt, "Retry time budget exhausted");
            }

            error!(
                %operation,
                object,
                attempts = attempt,
                retriable = err.is_retriable(),
                error = %err,
                "Remote call failed"
            );
            return Err(SinkError::Remote {
                operation,
                object: object.to_string(),
                attempts: attempt,
                source: err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::error::Failure;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> RemoteError {
        RemoteError::from_status(503, "Service Unavailable".into())
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for attempt in 1..=10 {
            let base = policy.base_delay(attempt).as_secs_f64();
            let delay = policy.delay_for(attempt, &mut rng);
            assert!(delay <= policy.max_delay);
            assert!(delay.as_secs_f64() >= base * (1.0 - policy.jitter_factor) - 1e-9);
            assert!(delay.as_secs_f64() <= base * (1.0 + policy.jitter_factor) + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let calls = AtomicU32::new(0);

        let result = executor
            .run(Operation::Upload, "w/a", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(unavailable())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(4));
        let calls = AtomicU32::new(0);

        let err = executor
            .run(Operation::Compose, "w/a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), 4);
        assert!(err.remote().unwrap().is_retriable());
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(5));
        let calls = AtomicU32::new(0);

        let err = executor
            .run(Operation::Delete, "w/a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RemoteError::from_status(404, "Not Found".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.remote().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried() {
        let executor = RetryExecutor::new(RetryPolicy::immediate(2));
        let calls = AtomicU32::new(0);

        let result = executor
            .run(Operation::Upload, "w/a", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(RemoteError::Retriable(Failure::Transport("reset".into())))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_time_budget_stops_retries() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            jitter_factor: 0.0,
            max_total_duration: Some(Duration::from_millis(10)),
            ..RetryPolicy::default()
        });
        let calls = AtomicU32::new(0);

        let err = executor
            .run(Operation::Upload, "w/a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_policy() {
        let executor = RetryExecutor::new(RetryPolicy::single_attempt());
        let calls = AtomicU32::new(0);

        let _ = executor
            .run(Operation::GetBucket, "bucket", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(unavailable()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
