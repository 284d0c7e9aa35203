//! Retry policy: backoff delays and error classification.

use std::time::Duration;

use waypoint_core::config::{RetryConfig, RetryStrategy};
use waypoint_core::ActionError;

/// Whether an error may succeed if the same call is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Classify an action error, independent of backoff strategy.
///
/// A timeout on a non-idempotent action is not retried: the first call may
/// already have taken effect.
pub fn classify(error: &ActionError, idempotent: bool) -> ErrorClass {
    match error {
        ActionError::RateLimited { .. } | ActionError::Transient(_) => ErrorClass::Retryable,
        ActionError::Timeout(_) if idempotent => ErrorClass::Retryable,
        _ => ErrorClass::NonRetryable,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Backoff before retry number `attempt + 1` (`attempt` is zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay_ms;
        let max = self.config.max_delay_ms;
        let ms = match self.config.strategy {
            RetryStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                initial.saturating_mul(factor).min(max)
            }
            RetryStrategy::Linear => initial.saturating_mul(u64::from(attempt) + 1).min(max),
            RetryStrategy::Immediate => 0,
        };
        Duration::from_millis(ms)
    }

    /// Delay before the next attempt, or `None` when the error must not be
    /// retried or attempts are used up. `attempt` is the zero-based attempt
    /// that just failed.
    pub fn next_delay(&self, error: &ActionError, idempotent: bool, attempt: u32) -> Option<Duration> {
        if classify(error, idempotent) == ErrorClass::NonRetryable {
            return None;
        }
        if attempt + 1 >= self.max_attempts() {
            return None;
        }
        let backoff = self.delay_for(attempt);
        match error {
            ActionError::RateLimited {
                retry_after: Some(after),
            } => Some(backoff.max(*after)),
            _ => Some(backoff),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
