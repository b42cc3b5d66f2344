use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CollaboratorError, EngineError};

/// Largest jitter ratio for which a jittered delay can never fall below the
/// previous retry's upper bound.
pub const MAX_JITTER_RATIO: f64 = 1.0 / 3.0;

/// Backoff and attempt limits for failed tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Total executions allowed per task, including the first.
    pub max_attempts: u32,
    /// Symmetric jitter applied to each delay, as a fraction of it.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 3,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Check the delays and attempt limit.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(EngineError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=MAX_JITTER_RATIO).contains(&self.jitter_ratio) {
            return Err(EngineError::Config(format!(
                "retry.jitter_ratio must be within [0, {MAX_JITTER_RATIO:.3}], got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

/// Why a failed task will not be retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    Exhausted,
    NonRetryable,
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GiveUpReason::Exhausted => f.write_str("attempts exhausted"),
            GiveUpReason::NonRetryable => f.write_str("non-retryable error"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

/// Exponential backoff with bounded jitter.
///
/// Delay for the retry after the `attempt`-th failed execution:
/// `min(max_delay, base_delay * 2^(attempt-1))`, jittered by
/// `±jitter_ratio` and clamped so it never drops below the largest delay the
/// previous retry could have produced.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from its settings.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Settings the policy was built with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total executions allowed per task, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Un-jittered delay in milliseconds. Attempt 0 has no delay.
    pub fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let scaled = (self.config.base_delay_ms as f64) * 2f64.powi(exp);
        scaled.min(self.config.max_delay_ms as f64).max(0.0) as u64
    }

    /// Delay before the retry that follows the `attempt`-th failure, without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.nominal_delay_ms(attempt))
    }

    /// Lower bound for attempt `attempt`: the upper bound of the one before.
    fn floor_ms(&self, attempt: u32) -> u64 {
        if attempt <= 1 {
            return 0;
        }
        let previous = self.nominal_delay_ms(attempt - 1) as f64;
        let upper = previous * (1.0 + self.config.jitter_ratio);
        upper.min(self.config.max_delay_ms as f64) as u64
    }

    /// Jittered delay before the retry that follows the `attempt`-th failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay_ms(attempt) as f64;
        let ratio = self.config.jitter_ratio;
        let offset = if ratio > 0.0 {
            nominal * ratio * (fastrand::f64() * 2.0 - 1.0)
        } else {
            0.0
        };
        let jittered = (nominal + offset).max(0.0) as u64;
        let clamped = jittered.clamp(self.floor_ms(attempt), self.config.max_delay_ms);
        Duration::from_millis(clamped)
    }

    /// Decide what happens after the `attempt`-th execution failed with `error`.
    pub fn decide(&self, attempt: u32, error: &CollaboratorError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NonRetryable,
            };
        }
        if attempt >= self.config.max_attempts {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::Exhausted,
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }
}
