//! Shared test utilities for the pipeline crates
//!
//! - `TestDatabase`: PostgreSQL container with automatic cleanup (feature: "postgres")
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestRabbitMq`: RabbitMQ container for AMQP broker tests (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic ids and names (always available)
//!
//! # Features
//!
//! - `postgres` (default): Enables PostgreSQL test infrastructure
//! - `redis`: Enables Redis test infrastructure
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables all of the above
//!
//! Container-backed tests need a local docker daemon; mark them
//! `#[ignore = "requires docker"]` and run with `cargo test -- --ignored`.
//!
//! ```rust,ignore
//! use test_utils::TestRedis;
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn ledger_roundtrip() {
//!     let redis = TestRedis::new().await;
//!     let ledger = RedisLedger::new(redis.connection());
//!     ledger.mark_processed("inventory:OrderCreated:abc").await.unwrap();
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Tests stay reproducible because every id is derived from the seed.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name, so each test gets its own stable ids.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_reserve_stock");
    /// let order_id = builder.uuid("order");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// A UUID unique to this seed and `purpose` (e.g. "order", "correlation").
    pub fn uuid(&self, purpose: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{}:{}", self.seed, purpose).as_bytes(),
        )
    }

    /// Name such as `test-customer-12345-main`.
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.uuid("order"), builder2.uuid("order"));
        assert_ne!(builder1.uuid("order"), builder1.uuid("correlation"));
        assert_eq!(
            builder1.name("customer", "main"),
            builder2.name("customer", "main")
        );
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.uuid("order"), builder2.uuid("order"));
    }
}
