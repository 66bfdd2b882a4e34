//! Retry policy with exponential backoff and jitter for HTTP collaborators

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Randomize delays by up to +/-25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Whether a failed attempt may be retried
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for reqwest::Error {
    fn is_retryable(&self) -> bool {
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return true;
        }
        self.status().is_some_and(is_retryable_status)
    }
}

/// 429 and 5xx are transient
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        if self.jitter {
            let factor = rand::rng().random_range(0.75..=1.25);
            delay = (delay * factor).min(self.max_delay_ms as f64);
        }
        Duration::from_millis(delay as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn execute<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && e.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky({})", self.0)
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for(2).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, Flaky> = fast()
            .execute("fetch", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(Flaky(true)) } else { Ok(n) }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Flaky> = fast()
            .execute("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), Flaky> = fast()
            .execute("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(reqwest::StatusCode::NOT_FOUND));
    }
}
