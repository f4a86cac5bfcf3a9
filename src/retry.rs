use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::FlowError;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits `interval`.
    #[default]
    Fixed,
    /// Retry `n` waits `n * interval`.
    Linear,
    /// Retry `n` waits `interval * multiplier^(n-1)`.
    Exponential { multiplier: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub retries: u32,
    pub interval: Duration,
    /// Upper bound for any computed delay; zero disables the bound.
    pub max_interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self {
            retries,
            interval,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// `attempt` is the number of attempts made so far, the failed one included.
    pub fn should_retry(&self, attempt: u32, error: &FlowError) -> RetryDecision {
        if !error.is_retryable() || attempt > self.retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    /// Delay before the retry that follows `attempt`. Non-decreasing in
    /// `attempt` for every backoff shape.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Linear => self.interval.saturating_mul(attempt),
            Backoff::Exponential { multiplier } => {
                // multipliers below 1 would shrink the delay
                let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
                    multiplier
                } else {
                    2.0
                };
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.interval.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
        };

        if self.max_interval.is_zero() {
            delay
        } else {
            delay.min(self.max_interval)
        }
    }
}
