use crate::{env_optional, ConfigError, FromEnv};

/// Redis connection for the idempotency ledger
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedisSettings {
    /// `None` when REDIS_URL is unset
    pub url: Option<String>,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
        }
    }
}

impl FromEnv for RedisSettings {
    /// REDIS_URL is optional
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_optional("REDIS_URL"),
        })
    }
}
