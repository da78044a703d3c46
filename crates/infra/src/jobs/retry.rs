//! Retry policy: exponential backoff with a bounded number of attempts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Returns true iff another attempt is allowed.
///
/// `attempt` is the 0-indexed number of the attempt about to be made, so with
/// `max_attempts = 2` attempts 0 and 1 run and attempt 2 does not.
pub fn should_retry(attempt: u32, max_attempts: u32) -> bool {
    attempt < max_attempts
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles with every further failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`.
    ///
    /// `attempt` is 0-indexed from the first failure. No jitter is applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        should_retry(attempt, self.max_attempts)
    }

    /// Decide after attempt `failed_attempt` (0-indexed) failed.
    pub fn decide(&self, failed_attempt: u32) -> RetryDecision {
        if self.should_retry(failed_attempt.saturating_add(1)) {
            RetryDecision::RetryAfter(self.next_delay(failed_attempt))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Errors that may be worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Outcome of a single attempt made by [`retry_with_policy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Terminal failure of [`retry_with_policy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    pub operation: &'static str,
    pub attempts: u32,
    pub last_error: AttemptError<E>,
}

/// Run `op` until it succeeds, the policy gives up, or it returns an error
/// that is not retryable.
///
/// Each attempt is bounded by `timeout`; a timeout counts as a retryable
/// failure. `op` receives the 0-indexed attempt number.
pub async fn retry_with_policy<T, E, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    timeout: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + core::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let error = match tokio::time::timeout(timeout, op(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => {
                return Err(RetryError {
                    operation,
                    attempts: attempt + 1,
                    last_error: AttemptError::Failed(e),
                });
            }
            Ok(Err(e)) => AttemptError::Failed(e),
            Err(_) => AttemptError::TimedOut(timeout),
        };

        match policy.decide(attempt) {
            RetryDecision::RetryAfter(delay) => {
                warn!(operation, attempt, error = %error, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            RetryDecision::GiveUp => {
                return Err(RetryError {
                    operation,
                    attempts: attempt + 1,
                    last_error: error,
                });
            }
        }
    }
}
