//! Retry/backoff policy
//!
//! Pollers consume the policy through the [`Backoff`] trait only: a delay
//! per attempt plus an attempt budget. [`ExponentialBackoff`] is the
//! default curve built from `retry_on_failure`.

use crate::config::RetryConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// Backoff contract used by the retry driver
pub trait Backoff: Send + Sync {
    /// Delay before retry number `attempt` (1-based: the first retry is 1)
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Total attempts allowed, including the first; at least 1
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff capped at `max_interval`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    /// Single attempt, no retries
    pub fn disabled() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: 1,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for ExponentialBackoff {
    fn from(config: &RetryConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self {
            initial_interval: config.initial_interval,
            max_interval: config.max_interval,
            multiplier: config.multiplier.max(1.0),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent
///
/// Only errors for which [`crate::IngestError::is_transient`] holds are
/// retried. The last error is returned when the budget runs out.
pub async fn retry<T, F, Fut>(backoff: &dyn Backoff, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = backoff.max_attempts();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff.next_delay(attempt);
                tracing::warn!(
                    operation = %what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff(max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 10,
        };
        assert_eq!(backoff.next_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(3), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(4), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_disabled_config_means_single_attempt() {
        let config = RetryConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(ExponentialBackoff::from(&config).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_backoff(3), "fetch", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IngestError::TransientApi("503".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_backoff(3), "fetch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::TransientApi("503".into()))
        })
        .await;

        assert!(matches!(result, Err(IngestError::TransientApi(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&fast_backoff(5), "fetch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::PermanentApi("401".into()))
        })
        .await;

        assert!(matches!(result, Err(IngestError::PermanentApi(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
