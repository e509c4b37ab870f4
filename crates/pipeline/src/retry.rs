//! Bounded retry with capped exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use log::{debug, warn};
use thiserror::Error;

use crate::config::RetrySettings;

/// Retry policy shared by the pipeline stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied to every single backoff sleep
    pub max_delay: Duration,
}

/// Failure returned once retrying stops
#[derive(Debug, Error)]
#[error("{last_error} (after {attempts} attempt(s))")]
pub struct RetryError<E> {
    pub last_error: E,
    /// Number of invocations made
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(RetrySettings::default().max_delay_ms),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sleep after the `attempt`-th failed invocation (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut, R>(&self, mut operation: F, is_retryable: R) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, self.max_attempts);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !is_retryable(&err) || attempt >= self.max_attempts {
                        return Err(RetryError { last_error: err, attempts: attempt });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, err, delay
                    );
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
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Fake {
        Timeout,
        Auth,
    }

    impl fmt::Display for Fake {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn retryable(e: &Fake) -> bool {
        *e == Fake::Timeout
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_transient_failures_then_success() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = policy
            .execute(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n <= 3 {
                            Err(Fake::Timeout)
                        } else {
                            Ok(n)
                        }
                    }
                },
                retryable,
            )
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = start.elapsed();
        // 100 * (2^0 + 2^1 + 2^2)
        assert!(elapsed >= Duration::from_millis(700), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(710), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invokes_once() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let err = policy
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Fake::Auth) }
                },
                retryable,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_error, Fake::Auth);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let err = policy
            .execute(|_| async { Err::<(), _>(Fake::Timeout) }, retryable)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(boxed.to_string(), "Timeout (after 3 attempt(s))");
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The backoff schedule doubles until it reaches the cap and never exceeds it
        #[test]
        fn test_backoff_schedule(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, attempt in 1u32..40) {
            let policy = RetryPolicy::new(50, Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(cap_ms));
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);

            prop_assert!(this <= Duration::from_millis(cap_ms));
            prop_assert!(next >= this);
            if next < Duration::from_millis(cap_ms) {
                prop_assert_eq!(next, this * 2);
            }
        }
    }
}
