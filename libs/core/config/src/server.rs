use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Worker process settings: where the health and admin server listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub host: String,
    pub health_port: u16,
}

impl WorkerSettings {
    pub fn new(host: String, health_port: u16) -> Self {
        Self { host, health_port }
    }

    /// Get the health server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.health_port)
    }
}

impl FromEnv for WorkerSettings {
    /// - HOST: defaults to 0.0.0.0
    /// - HEALTH_PORT: defaults to 8081
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let health_port = env_parse("HEALTH_PORT", 8081u16)?;
        Ok(Self { host, health_port })
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            health_port: 8081,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_settings_defaults() {
        temp_env::with_vars([("HOST", None::<&str>), ("HEALTH_PORT", None::<&str>)], || {
            let settings = WorkerSettings::from_env().unwrap();
            assert_eq!(settings, WorkerSettings::default());
            assert_eq!(settings.address(), "0.0.0.0:8081");
        });
    }

    #[test]
    fn test_worker_settings_custom_port() {
        temp_env::with_vars([("HOST", Some("127.0.0.1")), ("HEALTH_PORT", Some("9000"))], || {
            let settings = WorkerSettings::from_env().unwrap();
            assert_eq!(settings.address(), "127.0.0.1:9000");
        });
    }

    #[test]
    fn test_worker_settings_port_out_of_range() {
        temp_env::with_var("HEALTH_PORT", Some("99999"), || {
            let err = WorkerSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("HEALTH_PORT"));
        });
    }
}
