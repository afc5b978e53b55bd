//! Broker, retry and circuit breaker settings.

use crate::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Broker connection, exchange names and consumer prefetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    /// AMQP URL; without one the worker runs on the in-process broker
    pub url: Option<String>,
    pub events_exchange: String,
    pub dead_letter_exchange: String,
    pub prefetch: u16,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            events_exchange: "integrahub.events".to_string(),
            dead_letter_exchange: "integrahub.dlx".to_string(),
            prefetch: 10,
        }
    }
}

impl FromEnv for BrokerSettings {
    /// - BROKER_URL: optional, must be an amqp(s) URL
    /// - EVENTS_EXCHANGE: defaults to "integrahub.events"
    /// - DEAD_LETTER_EXCHANGE: defaults to "integrahub.dlx"
    /// - PREFETCH: defaults to 10, must be at least 1
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let prefetch: u16 = env_parse("PREFETCH", defaults.prefetch)?;
        if prefetch == 0 {
            return Err(ConfigError::Invalid {
                key: "PREFETCH".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        let url = env_optional("BROKER_URL");
        if let Some(url) = &url {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err(ConfigError::Invalid {
                    key: "BROKER_URL".to_string(),
                    details: "must be an amqp:// or amqps:// URL".to_string(),
                });
            }
        }

        Ok(Self {
            url,
            events_exchange: env_or_default("EVENTS_EXCHANGE", &defaults.events_exchange),
            dead_letter_exchange: env_or_default(
                "DEAD_LETTER_EXCHANGE",
                &defaults.dead_letter_exchange,
            ),
            prefetch,
        })
    }
}

/// Retry budget and exponential backoff bounds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Backoff cap; also the delay queue TTL
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl FromEnv for RetrySettings {
    /// - MAX_RETRIES: defaults to 3
    /// - RETRY_BASE_DELAY_MS: defaults to 1000, must be positive
    /// - RETRY_MAX_DELAY_MS: defaults to 30000, must not be below the base delay
    fn from_env() -> Result<Self, ConfigError> {
        let max_retries = env_parse("MAX_RETRIES", 3u32)?;
        let base_ms: u64 = env_parse("RETRY_BASE_DELAY_MS", 1_000)?;
        let max_ms: u64 = env_parse("RETRY_MAX_DELAY_MS", 30_000)?;

        if base_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "RETRY_BASE_DELAY_MS".to_string(),
                details: "must be positive".to_string(),
            });
        }
        if max_ms < base_ms {
            return Err(ConfigError::Invalid {
                key: "RETRY_MAX_DELAY_MS".to_string(),
                details: format!("{max_ms} is below RETRY_BASE_DELAY_MS ({base_ms})"),
            });
        }

        Ok(Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        })
    }
}

/// Circuit breaker thresholds for outbound calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl FromEnv for BreakerSettings {
    /// - BREAKER_FAILURE_THRESHOLD: defaults to 3, must be at least 1
    /// - BREAKER_COOLDOWN_SECS: defaults to 30
    fn from_env() -> Result<Self, ConfigError> {
        let failure_threshold = env_parse("BREAKER_FAILURE_THRESHOLD", 3u32)?;
        if failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "BREAKER_FAILURE_THRESHOLD".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        let cooldown_secs: u64 = env_parse("BREAKER_COOLDOWN_SECS", 30)?;

        Ok(Self {
            failure_threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }
}
