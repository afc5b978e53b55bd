//! Retry policy
//!
//! Attempt `n` (the `x-retries` value of the failed delivery) is retried after
//! `base * 2^n`, capped at `max_delay`, until `n` reaches `max_retries`.

use crate::error::{ErrorCategory, HandlerError};
use std::time::Duration;

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish to the delay queue; it comes back after `delay`
    RetryWithDelay(Duration),
    /// Route to the dead-letter sink; terminal
    DeadLetter,
}

/// How business rejections are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Permanent errors consume the retry budget like transient ones
    #[default]
    RetryLikeTransient,
    /// Permanent errors skip the delay queue and are dead-lettered at once
    DeadLetterImmediately,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a delivery is dead-lettered
    pub max_retries: u32,

    /// Delay of the first retry
    pub base_delay: Duration,

    /// Upper bound of any delay, also the delay queue TTL
    pub max_delay: Duration,

    /// Treatment of permanent errors
    pub rejection: RejectionPolicy,
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and default delays
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the rejection policy
    pub fn with_rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.rejection = rejection;
        self
    }

    /// Delay before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide the fate of a delivery that failed on `attempt`
    pub fn decide(&self, attempt: u32, error: &HandlerError) -> RetryDecision {
        if error.category() == ErrorCategory::Permanent
            && self.rejection == RejectionPolicy::DeadLetterImmediately
        {
            return RetryDecision::DeadLetter;
        }

        if attempt < self.max_retries {
            RetryDecision::RetryWithDelay(self.backoff(attempt))
        } else {
            RetryDecision::DeadLetter
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            rejection: RejectionPolicy::default(),
        }
    }
}
