//! Idempotency ledger
//!
//! A durable set of keys whose side effect has already been applied. A key is
//! written only after the handler succeeded and is never updated or expired;
//! compaction is left to operators.
//!
//! Writes are insert-if-absent, so two consumers racing on the same key both
//! succeed and the first timestamp wins. Both may have run the side effect; the
//! ledger narrows the at-least-once window, it does not close it.

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresLedger;
#[cfg(feature = "redis")]
pub use self::redis::RedisLedger;

use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Durable key -> first-processed record.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Whether `key` has been recorded.
    async fn has_processed(&self, key: &str) -> Result<bool, LedgerError>;

    /// Record `key`. Recording an existing key is a no-op.
    async fn mark_processed(&self, key: &str) -> Result<(), LedgerError>;
}

/// Process-local ledger for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store becoming unreachable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// When `key` was first recorded.
    pub fn processed_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock().get(key).copied()
    }

    /// Number of recorded keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::Storage("ledger unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn has_processed(&self, key: &str) -> Result<bool, LedgerError> {
        self.check()?;
        Ok(self.lock().contains_key(key))
    }

    async fn mark_processed(&self, key: &str) -> Result<(), LedgerError> {
        self.check()?;
        self.lock().entry(key.to_string()).or_insert_with(Utc::now);
        Ok(())
    }
}
