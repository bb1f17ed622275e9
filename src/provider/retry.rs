//! Exponential backoff retry policy for provider adapter calls.
//!
//! Grounded on the same shape as a typical cloud-CLI retry module: a policy
//! struct holding the backoff parameters, an `execute` method that loops
//! calling a closure and consulting `IsRetryable` on failure.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{IsRetryable, ProviderError};

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_FACTOR: f64 = 2.0;

/// Exponential backoff: base 500ms, factor 2, max 30s, cap 5 attempts.
/// `RateLimitError`, `NetworkError`, and `AvailabilityError` are retried;
/// `BillingError` and `AuthError` are not.
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_millis() as f64 * BACKOFF_FACTOR.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);
        let jitter = capped * 0.1 * fastrand::f64();
        Duration::from_millis((capped + jitter) as u64)
    }

    pub async fn execute<F, Fut, T>(&self, provider: &str, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            match f().await {
                Ok(v) => {
                    if attempt > 0 {
                        info!(provider, attempt, "provider call succeeded after retry");
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt + 1 == self.max_attempts {
                        warn!(provider, attempts = self.max_attempts, error = %e, "retries exhausted");
                        last_err = Some(e);
                        break;
                    }
                    let delay = self.backoff(attempt);
                    warn!(provider, attempt, ?delay, error = %e, "retrying provider call");
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err.expect("loop always records an error before exiting without returning Ok"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_immediately_without_retrying() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result = policy
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_network_errors_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .execute("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::Network {
                        provider: "test".into(),
                        message: "timeout".into(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Auth {
                    provider: "test".into(),
                    message: "bad key".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_retry_billing_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Billing {
                    provider: "test".into(),
                    message: "quota exceeded".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_and_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::RateLimit {
                    provider: "test".into(),
                    message: "429".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
