//! Consumer configuration
//!
//! This module provides `ConsumerConfig` for configuring an event consumer.

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Configuration for an event consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Maximum unacknowledged deliveries (and therefore concurrent handlers)
    pub prefetch: u16,

    /// How long in-flight handlers may run after shutdown was requested
    pub shutdown_grace: Duration,

    /// Retry budget and backoff
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    /// Create a new ConsumerConfig with the given prefetch
    pub fn new(prefetch: u16) -> Self {
        Self {
            prefetch: prefetch.max(1),
            ..Default::default()
        }
    }

    /// Set the prefetch
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}
