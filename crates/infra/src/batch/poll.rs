//! Bounded polling for long-running load jobs.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Backoff strategy between polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between polls
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1), capped at `max_delay`
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy {other:?} (fixed|exponential)")),
        }
    }
}

/// How often, and how many times, a job status is checked.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of checks before giving up
    pub max_attempts: u32,
    /// Base delay between checks
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// One check per second for two minutes.
    fn default() -> Self {
        Self::fixed(120, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay after a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay.max(self.base_delay))
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError<E> {
    /// The condition was not met within the policy's attempts.
    #[error("gave up after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// A check failed outright.
    #[error("{0}")]
    Check(E),
}

/// Run `check` until it yields a value, an error, or the policy runs out.
///
/// `check` receives the 1-indexed attempt number and returns `Ok(None)` while
/// the awaited condition is not met yet.
pub async fn poll_until<T, E, F, Fut>(policy: &RetryPolicy, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut attempt = 0;

    while policy.should_retry(attempt) {
        attempt += 1;
        if let Some(value) = check(attempt).await.map_err(PollError::Check)? {
            return Ok(value);
        }
        if policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "condition not met yet");
            sleep(delay).await;
        }
    }

    Err(PollError::Timeout { attempts: attempt })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 120);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(90), Duration::from_secs(1));
    }

    #[test]
    fn strategy_parses_from_config_values() {
        assert_eq!("fixed".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Fixed));
        assert_eq!(
            " Exponential ".parse::<BackoffStrategy>(),
            Ok(BackoffStrategy::Exponential)
        );
        assert!("linear".parse::<BackoffStrategy>().is_err());
    }

    #[tokio::test]
    async fn poll_returns_first_ready_value() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<u32, PollError<String>> =
            poll_until(&policy, |attempt| async move {
                Ok((attempt == 3).then_some(attempt))
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn poll_times_out_after_max_attempts() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(1));
        let mut seen = 0;
        let result: Result<(), PollError<String>> = poll_until(&policy, |attempt| {
            seen = attempt;
            async { Ok(None) }
        })
        .await;
        assert_eq!(result, Err(PollError::Timeout { attempts: 4 }));
        assert_eq!(seen, 4);
    }

    #[tokio::test]
    async fn poll_stops_on_check_error() {
        let policy = RetryPolicy::fixed(10, Duration::from_millis(1));
        let result: Result<(), PollError<String>> =
            poll_until(&policy, |_| async { Err("status endpoint down".to_string()) }).await;
        assert_eq!(result, Err(PollError::Check("status endpoint down".to_string())));
    }
}
