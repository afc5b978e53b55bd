//! Redis-backed ledger
//!
//! One string key per record (`<prefix><key>` -> RFC 3339 timestamp), written with
//! `SET NX` so the first writer wins.

use super::IdempotencyLedger;
use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::debug;

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "integrahub:processed:";

#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisLedger {
    /// Create a ledger using the default key prefix.
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, DEFAULT_PREFIX)
    }

    /// Create a ledger with a custom key prefix.
    pub fn with_prefix(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn has_processed(&self, key: &str) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn mark_processed(&self, key: &str) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(Utc::now().to_rfc3339())
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if stored.is_none() {
            debug!(key, "Ledger key already present");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::TestRedis;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_redis_ledger_insert_if_absent() {
        let redis = TestRedis::new().await;
        let ledger = RedisLedger::with_prefix(redis.connection(), "test:processed:");

        assert!(!ledger.has_processed("OrderCreated:abc").await.unwrap());
        ledger.mark_processed("OrderCreated:abc").await.unwrap();
        ledger.mark_processed("OrderCreated:abc").await.unwrap();
        assert!(ledger.has_processed("OrderCreated:abc").await.unwrap());
    }
}
