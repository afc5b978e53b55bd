//! Postgres-backed ledger
//!
//! Records live in `processed_events`; `mark_processed` relies on the primary key
//! and `ON CONFLICT DO NOTHING`.

use super::IdempotencyLedger;
use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use tracing::debug;

/// DDL for the ledger table
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_events (
    idempotency_key TEXT PRIMARY KEY,
    processed_at    TIMESTAMPTZ NOT NULL
)
"#;

#[derive(Debug, FromQueryResult)]
struct Presence {
    present: bool,
}

#[derive(Clone)]
pub struct PostgresLedger {
    db: DatabaseConnection,
}

impl PostgresLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create the ledger table if missing.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        self.db.execute_unprepared(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedger {
    async fn has_processed(&self, key: &str) -> Result<bool, LedgerError> {
        let sql = "SELECT EXISTS(SELECT 1 FROM processed_events WHERE idempotency_key = $1) AS present";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [key.into()]);

        let row = Presence::find_by_statement(stmt).one(&self.db).await?;
        Ok(row.is_some_and(|r| r.present))
    }

    async fn mark_processed(&self, key: &str) -> Result<(), LedgerError> {
        let sql = r#"
            INSERT INTO processed_events (idempotency_key, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (idempotency_key) DO NOTHING
        "#;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [key.into(), Utc::now().into()],
        );

        let result = self.db.execute_raw(stmt).await?;
        if result.rows_affected() == 0 {
            debug!(key, "Ledger key already present");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::TestDatabase;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_postgres_ledger_insert_if_absent() {
        let db = TestDatabase::new().await;
        let ledger = PostgresLedger::new(db.connection());
        ledger.ensure_schema().await.unwrap();

        assert!(!ledger.has_processed("OrderCreated:abc").await.unwrap());
        ledger.mark_processed("OrderCreated:abc").await.unwrap();
        ledger.mark_processed("OrderCreated:abc").await.unwrap();
        assert!(ledger.has_processed("OrderCreated:abc").await.unwrap());
    }
}
