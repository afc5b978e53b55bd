//! PostgreSQL stores built on raw statements.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use uuid::Uuid;

use crate::error::{OrderError, OrderResult};
use crate::models::{DailyAggregate, OrderItem, Reservation};
use crate::repository::{AnalyticsStore, ReservationStore};

/// DDL for the reservation and analytics tables
pub const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, FromQueryResult)]
struct ReservationRow {
    order_id: Uuid,
    customer_id: String,
    items: serde_json::Value,
    amount_cents: i64,
    reserved_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = OrderError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let items: Vec<OrderItem> = serde_json::from_value(row.items)?;
        Ok(Reservation {
            order_id: row.order_id,
            customer_id: row.customer_id,
            items,
            amount_cents: row.amount_cents,
            reserved_at: row.reserved_at,
        })
    }
}

#[derive(Debug, FromQueryResult)]
struct DailyRow {
    date: NaiveDate,
    total_orders: i64,
    total_revenue_cents: i64,
    last_updated: DateTime<Utc>,
}

impl From<DailyRow> for DailyAggregate {
    fn from(row: DailyRow) -> Self {
        DailyAggregate {
            date: row.date,
            total_orders: row.total_orders,
            total_revenue_cents: row.total_revenue_cents,
            last_updated: row.last_updated,
        }
    }
}

/// PostgreSQL implementation of the reservation and analytics stores
#[derive(Clone)]
pub struct PgOrderStore {
    db: DatabaseConnection,
}

impl PgOrderStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create the tables if missing.
    pub async fn ensure_schema(&self) -> OrderResult<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.db.execute_unprepared(statement).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PgOrderStore {
    async fn upsert_reservation(&self, reservation: &Reservation) -> OrderResult<()> {
        let sql = r#"
            INSERT INTO inventory_reservations (order_id, customer_id, items, amount_cents, reserved_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (order_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                items = EXCLUDED.items,
                amount_cents = EXCLUDED.amount_cents
        "#;

        let items = serde_json::to_value(&reservation.items)?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [
                reservation.order_id.into(),
                reservation.customer_id.clone().into(),
                items.into(),
                reservation.amount_cents.into(),
                reservation.reserved_at.into(),
            ],
        );

        self.db.execute_raw(stmt).await?;
        tracing::info!(order_id = %reservation.order_id, "Stored reservation");
        Ok(())
    }

    async fn get_reservation(&self, order_id: Uuid) -> OrderResult<Option<Reservation>> {
        let sql = "SELECT * FROM inventory_reservations WHERE order_id = $1";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [order_id.into()]);

        let row = ReservationRow::find_by_statement(stmt).one(&self.db).await?;
        row.map(Reservation::try_from).transpose()
    }
}

#[async_trait]
impl AnalyticsStore for PgOrderStore {
    async fn record_confirmed_order(
        &self,
        date: NaiveDate,
        amount_cents: i64,
    ) -> OrderResult<DailyAggregate> {
        let sql = r#"
            INSERT INTO analytics_daily (date, total_orders, total_revenue_cents, last_updated)
            VALUES ($1, 1, $2, NOW())
            ON CONFLICT (date) DO UPDATE SET
                total_orders = analytics_daily.total_orders + 1,
                total_revenue_cents = analytics_daily.total_revenue_cents + EXCLUDED.total_revenue_cents,
                last_updated = NOW()
            RETURNING *
        "#;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            sql,
            [date.into(), amount_cents.into()],
        );

        DailyRow::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .map(DailyAggregate::from)
            .ok_or_else(|| OrderError::Storage("analytics upsert returned no row".to_string()))
    }

    async fn daily(&self, date: NaiveDate) -> OrderResult<Option<DailyAggregate>> {
        let sql = "SELECT * FROM analytics_daily WHERE date = $1";
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [date.into()]);

        let row = DailyRow::find_by_statement(stmt).one(&self.db).await?;
        Ok(row.map(DailyAggregate::from))
    }
}
