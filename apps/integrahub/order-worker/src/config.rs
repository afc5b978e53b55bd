//! Process configuration, loaded once from the environment.

use core_config::{
    BreakerSettings, BrokerSettings, ConfigError, Environment, FromEnv, NotifierSettings,
    PostgresSettings, RedisSettings, RetrySettings, WorkerSettings,
};
use domain_orders::order_topology;
use event_pipeline::{CircuitBreakerConfig, ConsumerConfig, RetryPolicy, Topology};

#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub broker: BrokerSettings,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub redis: RedisSettings,
    pub postgres: PostgresSettings,
    pub notifier: NotifierSettings,
    pub worker: WorkerSettings,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: Environment::from_env(),
            broker: BrokerSettings::from_env()?,
            retry: RetrySettings::from_env()?,
            breaker: BreakerSettings::from_env()?,
            redis: RedisSettings::from_env()?,
            postgres: PostgresSettings::from_env()?,
            notifier: NotifierSettings::from_env()?,
            worker: WorkerSettings::from_env()?,
        })
    }
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_retries)
            .with_base_delay(self.retry.base_delay)
            .with_max_delay(self.retry.max_delay)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(self.broker.prefetch).with_retry_policy(self.retry_policy())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_cooldown(self.breaker.cooldown)
    }

    /// Order topology whose delay queues hold messages up to the backoff cap.
    pub fn topology(&self) -> Topology {
        order_topology(&self.broker.events_exchange, &self.broker.dead_letter_exchange)
            .with_max_delay(self.retry.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const VARS: [&str; 13] = [
        "APP_ENV",
        "BROKER_URL",
        "EVENTS_EXCHANGE",
        "DEAD_LETTER_EXCHANGE",
        "PREFETCH",
        "MAX_RETRIES",
        "RETRY_BASE_DELAY_MS",
        "RETRY_MAX_DELAY_MS",
        "BREAKER_FAILURE_THRESHOLD",
        "BREAKER_COOLDOWN_SECS",
        "REDIS_URL",
        "DATABASE_URL",
        "SLACK_WEBHOOK_URL",
    ];

    #[test]
    fn test_defaults_match_the_pipeline_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.broker.url, None);
            assert_eq!(config.consumer_config(), ConsumerConfig::default());
            assert_eq!(config.breaker_config(), CircuitBreakerConfig::default());

            let topology = config.topology();
            assert_eq!(topology.events_exchange(), "integrahub.events");
            assert_eq!(topology.max_delay(), Duration::from_secs(30));
            assert_eq!(topology.routes().len(), 3);
        });
    }

    #[test]
    fn test_retry_settings_reach_the_topology() {
        temp_env::with_vars(
            [
                ("MAX_RETRIES", Some("5")),
                ("RETRY_BASE_DELAY_MS", Some("100")),
                ("RETRY_MAX_DELAY_MS", Some("2000")),
            ],
            || {
                let config = Config::from_env().unwrap();
                let policy = config.retry_policy();
                assert_eq!(policy.max_retries, 5);
                assert_eq!(policy.backoff(0), Duration::from_millis(100));
                assert_eq!(config.topology().max_delay(), Duration::from_secs(2));
            },
        );
    }

    #[test]
    fn test_invalid_setting_fails_the_whole_config() {
        temp_env::with_var("BREAKER_FAILURE_THRESHOLD", Some("zero"), || {
            assert!(Config::from_env().is_err());
        });
    }
}
