use crate::{env_optional, ConfigError, FromEnv};

/// PostgreSQL connection for stores and the ledger
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostgresSettings {
    /// `None` when DATABASE_URL is unset
    pub url: Option<String>,
}

impl PostgresSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
        }
    }
}

impl FromEnv for PostgresSettings {
    /// DATABASE_URL is optional
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_optional("DATABASE_URL"),
        })
    }
}
