//! Exponential backoff with jitter around fallible async operations.

use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::errors::{Result, SyncError};

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Apply ±20% uniform jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Delay before retrying after the 0-indexed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(24);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max_delay);
        if !self.jitter {
            return backoff;
        }
        let millis = backoff.as_millis() as u64;
        let spread = millis / 5;
        if spread == 0 {
            return backoff;
        }
        let jittered = rand::thread_rng().gen_range(millis - spread..=millis + spread);
        Duration::from_millis(jittered)
    }
}

/// Run `operation` until it succeeds, a permanent error occurs, or
/// `max_attempts` is exhausted. There is no sleep after the final attempt;
/// the last error is returned as-is.
pub async fn retry<T, F, Fut>(mut operation: F, options: &RetryOptions, context: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    warn!("[{context}] permanent failure, not retrying: {err}");
                    return Err(err);
                }
                attempt += 1;
                if attempt >= max_attempts {
                    warn!("[{context}] giving up after {attempt} attempts: {err}");
                    return Err(err);
                }
                let delay = options.delay_for_attempt(attempt - 1);
                debug!(
                    "[{context}] attempt {attempt}/{max_attempts} failed ({err}); retrying in {}ms",
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }
}

/// Failure classification attached to dead-lettered jobs.
pub fn failure_reason(err: &SyncError) -> crate::dlq::FailureReason {
    if err.is_retryable() {
        crate::dlq::FailureReason::MaxRetries
    } else {
        crate::dlq::FailureReason::NonRetryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options() -> RetryOptions {
        RetryOptions {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SyncError::api(503, "unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            },
            &options(),
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_bail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::api(400, "bad request")) }
            },
            &options(),
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::api(429, "rate limited")) }
            },
            &options(),
            "test",
        )
        .await;
        assert_eq!(result.unwrap_err().status_code(), Some(429));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn delay_doubles_and_caps() {
        let options = RetryOptions {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(options.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(options.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(options.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(options.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let options = RetryOptions {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = options.delay_for_attempt(0).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} out of range");
        }
    }
}
