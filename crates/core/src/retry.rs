//! Retry and backoff for SSH command dispatch.
//!
//! The SSH taxonomy (see [`crate::errors::SshError`]) distinguishes
//! transient failures (connection reset, timeout) from terminal ones
//! (validation, auth, command exit status). [`SshExecutor`](crate::ssh::SshExecutor)
//! retries only the transient class, at a fixed 1s/2s/4s cadence with no
//! jitter, since the delay sequence itself is part of the documented retry
//! contract rather than an implementation detail.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Jitter strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JitterStrategy {
    /// Random delay between 0 and the calculated delay.
    #[default]
    FullJitter,
    /// No jitter: exact exponential backoff. Used where the delay sequence
    /// itself is part of the contract (SSH transient retry: 1s/2s/4s).
    None,
}

/// Retry policy: attempt cap, exponential backoff bounds, jitter strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts, excluding the initial attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterStrategy,
}

impl RetryConfig {
    /// The transient-error retry policy from the SSH error taxonomy: up to
    /// 3 retries (4 attempts total) at 1s/2s/4s, uncapped jitter disabled so
    /// the delay sequence stays exact.
    pub fn transient_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            jitter: JitterStrategy::None,
        }
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = self.base_delay.as_millis().saturating_mul(2_u128.pow(attempt));
        let capped_delay = exponential_delay.min(self.max_delay.as_millis());
        self.apply_jitter(Duration::from_millis(capped_delay as u64))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        match self.jitter {
            JitterStrategy::FullJitter => {
                let jitter_ms = fastrand::u64(0..=delay.as_millis() as u64);
                Duration::from_millis(jitter_ms)
            }
            JitterStrategy::None => delay,
        }
    }

    #[cfg(test)]
    fn apply_jitter_seeded(&self, delay: Duration, seed: u64) -> Duration {
        let mut rng = fastrand::Rng::with_seed(seed);
        match self.jitter {
            JitterStrategy::FullJitter => Duration::from_millis(rng.u64(0..=delay.as_millis() as u64)),
            JitterStrategy::None => delay,
        }
    }

    #[cfg(test)]
    fn calculate_delay_seeded(&self, attempt: u32, seed: u64) -> Duration {
        let exponential_delay = self.base_delay.as_millis().saturating_mul(2_u128.pow(attempt));
        let capped_delay = exponential_delay.min(self.max_delay.as_millis());
        self.apply_jitter_seeded(Duration::from_millis(capped_delay as u64), seed)
    }
}

/// Whether a failed attempt should be retried, decided by the caller's
/// error classifier (e.g. `SshExecutor` retries only on a spawn timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

pub type ErrorClassifier<E> = fn(&E) -> RetryDecision;

/// Run `operation` up to `config.max_attempts + 1` times, sleeping between
/// attempts per `config`'s backoff, stopping early when `classify_error`
/// says an error is terminal.
#[instrument(level = "debug", skip(operation, classify_error))]
pub async fn retry_async<T, E, Fut, Op>(
    config: &RetryConfig,
    operation: Op,
    classify_error: ErrorClassifier<E>,
) -> std::result::Result<T, E>
where
    Op: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut last_error = None;

    for attempt in 0..=config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "ssh command succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if classify_error(&error) == RetryDecision::Stop {
                    return Err(error);
                }
                last_error = Some(error);
                if attempt < config.max_attempts {
                    let delay = config.calculate_delay(attempt);
                    debug!(attempt, ?delay, "retrying transient ssh failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let final_error = last_error.expect("at least one attempt runs before this point");
    warn!(attempts = config.max_attempts + 1, error = ?final_error, "ssh command exhausted all retries");
    Err(final_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn transient_default_matches_the_documented_1s_2s_4s_cadence() {
        let config = RetryConfig::transient_default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.jitter, JitterStrategy::None);
        assert_eq!(config.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max_delay_beyond_the_cadence() {
        let config = RetryConfig::transient_default();
        // attempt 5 would exponentially want 32s; the ssh transient policy
        // caps every delay at 4s rather than growing unbounded.
        assert_eq!(config.calculate_delay(5), Duration::from_secs(4));
    }

    #[test]
    fn full_jitter_never_exceeds_the_unjittered_delay() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::FullJitter,
        };
        let seed = 12345;
        assert!(config.calculate_delay_seeded(0, seed).as_millis() <= 100);
        assert!(config.calculate_delay_seeded(1, seed).as_millis() <= 200);
        assert!(config.calculate_delay_seeded(2, seed).as_millis() <= 400);
    }

    #[tokio::test]
    async fn succeeds_without_retrying_when_the_first_attempt_works() {
        let config = RetryConfig::transient_default();
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let operation = move || {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<i32, &'static str>(0)
            }
        };

        let result = retry_async(&config, operation, |_: &&str| RetryDecision::Retry).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_a_transient_spawn_timeout_until_it_succeeds() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: JitterStrategy::None,
        };

        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let operation = move || {
            let count = call_count_clone.clone();
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    Err("ssh command timed out")
                } else {
                    Ok(0)
                }
            }
        };

        let result = retry_async(&config, operation, |_: &&str| RetryDecision::Retry).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_every_attempt_before_giving_up() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: JitterStrategy::None,
        };

        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let operation = move || {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<i32, &'static str>("ssh command timed out")
            }
        };

        let result = retry_async(&config, operation, |_: &&str| RetryDecision::Retry).await;
        assert_eq!(result.unwrap_err(), "ssh command timed out");
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_terminal_classification_stops_retrying_immediately() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: JitterStrategy::None,
        };

        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = Arc::clone(&call_count);

        let operation = move || {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<i32, i32>(1) // auth failure, not a timeout
            }
        };

        let result = retry_async(&config, operation, |_: &i32| RetryDecision::Stop).await;
        assert_eq!(result.unwrap_err(), 1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_config_round_trips_through_json() {
        let config = RetryConfig::transient_default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.max_attempts, config.max_attempts);
        assert_eq!(deserialized.jitter, config.jitter);
    }
}
