//! Retry policy: `retries + 1` attempts, each bounded by its own timeout

use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Pause between failed attempts.
///
/// Off by default so the worst-case latency of a request stays at
/// `(retries + 1) * timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Pause before the first retry; zero disables backoff
    pub initial: Duration,

    /// Maximum backoff duration
    pub max: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 30% jitter to each pause
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl Backoff {
    /// Read `{prefix}_RETRY_BACKOFF_MS`, `{prefix}_MAX_BACKOFF_MS`,
    /// `{prefix}_BACKOFF_MULTIPLIER` and `{prefix}_RETRY_JITTER`
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();
        let millis = |name: &str| {
            var(name)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        Self {
            initial: millis("RETRY_BACKOFF_MS").unwrap_or(defaults.initial),
            max: millis("MAX_BACKOFF_MS").unwrap_or(defaults.max),
            multiplier: var("BACKOFF_MULTIPLIER")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.multiplier),
            jitter: var("RETRY_JITTER")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.jitter),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.initial.is_zero()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(FetchError::InvalidConfig(format!(
                "backoff multiplier must be a finite value >= 1, got {}",
                self.multiplier
            )));
        }
        if self.is_enabled() && self.max < self.initial {
            return Err(FetchError::InvalidConfig(
                "max backoff is shorter than the initial backoff".to_string(),
            ));
        }
        Ok(())
    }

    fn next(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,

    /// Budget of every single attempt
    pub attempt_timeout: Duration,

    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            attempt_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            retries,
            attempt_timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `f` receives the zero-based attempt number.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.backoff.initial;

        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, f(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if !e.should_retry() || attempt >= self.retries => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!("Attempt {} failed: {}", attempt, e);

                    if !backoff.is_zero() {
                        let mut delay = backoff;
                        if self.backoff.jitter {
                            let jitter = rng().random_range(0.0..0.3);
                            #[allow(clippy::cast_precision_loss)]
                            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
                            delay += Duration::from_millis(jitter_ms);
                        }
                        tokio::time::sleep(delay).await;

                        backoff = self.backoff.next(backoff);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.max_attempts(), 3);
        assert!(!policy.backoff.is_enabled());
        assert!(!policy.backoff.jitter);
    }

    #[tokio::test]
    async fn test_execute_success_on_first_try() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(42)
                }
            })
            .await;

        assert_eq!(result.expect("success"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_retry_on_retryable_error() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(FetchError::Transport("connection reset".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("success"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_fail_on_non_retryable_error() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::HttpStatus(400))
                }
            })
            .await;

        assert_eq!(result.expect_err("should fail"), FetchError::HttpStatus(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_exceed_retries() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::ServerError(503))
                }
            })
            .await;

        assert_eq!(result.expect_err("should fail"), FetchError::ServerError(503));
        // initial + retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_timeout() {
        let policy = RetryPolicy::new(1, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = policy
            .execute(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, FetchError>(())
                }
            })
            .await;

        assert_eq!(
            result.expect_err("should time out"),
            FetchError::Timeout(Duration::from_millis(100))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_progression() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_backoff(Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(25),
            multiplier: 2.0,
            jitter: false,
        });
        let start = Instant::now();

        let _ = policy
            .execute(|_| async { Err::<(), _>(FetchError::Timeout(Duration::ZERO)) })
            .await;

        // 10ms + 20ms + 25ms (capped)
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(55));
        assert!(elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_adds_at_most_thirty_percent() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1)).with_backoff(Backoff {
            initial: Duration::from_millis(100),
            jitter: true,
            ..Backoff::default()
        });
        let start = Instant::now();

        let _ = policy
            .execute(|_| async { Err::<(), _>(FetchError::Transport("reset".to_string())) })
            .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(130));
    }

    #[test]
    fn test_backoff_validation() {
        assert!(Backoff::default().validate().is_ok());

        let shrinking = Backoff {
            multiplier: 0.5,
            ..Backoff::default()
        };
        assert!(matches!(shrinking.validate(), Err(FetchError::InvalidConfig(_))));

        let inverted = Backoff {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(1),
            ..Backoff::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_next_backoff_saturates_at_max() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(3),
            multiplier: 1e300,
            jitter: false,
        };
        assert_eq!(backoff.next(Duration::from_secs(1)), Duration::from_secs(3));
    }
}
