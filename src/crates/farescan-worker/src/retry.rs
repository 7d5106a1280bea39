//! Retry with exponential backoff
//!
//! Errors classify themselves as transient or permanent. Transient errors are
//! retried up to `max_retries` times with exponentially growing, capped
//! delays; permanent errors return immediately.

use crate::config::RetrySettings;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed on retry (network, timeout, rate limit)
    Transient,
    /// Will not succeed on retry
    Permanent,
}

/// Errors that know whether retrying them makes sense
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_delay_ms),
            max_backoff: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests and tight loops
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64) as u64;

        let delay_ms = if self.jitter && capped > 0 {
            capped + (capped as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts retries.
///
/// Returns the last error on failure; callers read its class to tell a
/// permanent failure from exhausted retries.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classify + Display,
{
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.class() == ErrorClass::Permanent => {
                debug!(operation, attempt, error = %e, "Permanent error, not retrying");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    error = %e,
                    "Retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.backoff_delay(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    #[test]
    fn test_default_schedule_is_5_10_20_capped_at_30() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.backoff_delay(0);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_millis(6250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let c = calls.clone();
        let result = retry_with_backoff(&policy, "search", move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError(ErrorClass::Transient))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_max_retries_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let c = calls.clone();
        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), _> = retry_with_backoff(&policy, "search", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorClass::Transient)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: std::result::Result<(), _> =
            retry_with_backoff(&RetryPolicy::immediate(5), "search", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorClass::Permanent)) }
            })
            .await;

        assert_eq!(result.unwrap_err().0, ErrorClass::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
