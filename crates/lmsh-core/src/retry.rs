//! Exponential backoff for transient adapter failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::{AdapterError, AdapterResult};
use crate::obs;

/// Retry policy applied by the adapter decorators.
///
/// `max_attempts` counts the first call, so `1` disables retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure on zero-based `attempt` should be retried.
    pub fn should_retry(&self, attempt: u32, error: &AdapterError) -> bool {
        error.is_transient() && attempt + 1 < self.max_attempts
    }

    /// Delay before the retry that follows zero-based `attempt`.
    ///
    /// A server `Retry-After` hint wins over the exponential schedule; both
    /// are capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, error: &AdapterError) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        if let Some(after) = error.retry_after() {
            return after.min(cap);
        }

        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        let ms = if self.jitter && exponential > 1 {
            rand::thread_rng().gen_range(exponential / 2..=exponential)
        } else {
            exponential
        };
        Duration::from_millis(ms)
    }

    /// Run `f` until it succeeds, fails permanently, or the attempt budget
    /// runs out. Exhaustion is reported as `AdapterError::RetriesExhausted`.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> AdapterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => return Err(error),
                Err(error) if !self.should_retry(attempt, &error) => {
                    warn!(operation, attempts = attempt + 1, error = %error, "retries exhausted");
                    return Err(AdapterError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt, &error);
                    obs::emit_retry_scheduled(operation, attempt + 1, delay, &error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert!(policy.jitter);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = fixed(10);
        let err = AdapterError::Unavailable("503".into());
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8, &err), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_after_wins() {
        let policy = fixed(10);
        let err = AdapterError::RateLimited {
            retry_after: Some(Duration::from_millis(750)),
        };
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(750));

        let long = AdapterError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.delay_for(0, &long), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..fixed(10)
        };
        let err = AdapterError::Timeout("read".into());
        for _ in 0..50 {
            let d = policy.delay_for(1, &err);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fixed(3)
            .execute("op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AdapterError::Unavailable("502".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = fixed(3)
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::RateLimited { retry_after: None })
            })
            .await;
        assert!(matches!(
            result,
            Err(AdapterError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: AdapterResult<()> = fixed(5)
            .execute("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AdapterError::Rejected("name taken".into()))
            })
            .await;
        assert_eq!(result, Err(AdapterError::Rejected("name taken".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
