use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrderError, OrderResult};
use crate::models::{DailyAggregate, Reservation};

/// Persistence for inventory reservations, keyed by order id
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Insert or replace the reservation of an order
    async fn upsert_reservation(&self, reservation: &Reservation) -> OrderResult<()>;

    /// Get the reservation of an order
    async fn get_reservation(&self, order_id: Uuid) -> OrderResult<Option<Reservation>>;
}

/// Persistence for daily analytics
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Add one confirmed order worth `amount_cents` to the aggregate of `date`
    async fn record_confirmed_order(
        &self,
        date: NaiveDate,
        amount_cents: i64,
    ) -> OrderResult<DailyAggregate>;

    /// Get the aggregate of a day
    async fn daily(&self, date: NaiveDate) -> OrderResult<Option<DailyAggregate>>;
}

/// In-memory implementation of both stores (for development/testing)
#[derive(Debug, Clone)]
pub struct InMemoryOrderStore {
    reservations: Arc<RwLock<HashMap<Uuid, Reservation>>>,
    daily: Arc<RwLock<HashMap<NaiveDate, DailyAggregate>>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self {
            reservations: Arc::default(),
            daily: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn reservation_count(&self) -> usize {
        self.reservations.read().await.len()
    }

    fn ensure_available(&self) -> OrderResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrderError::Storage("store unavailable".to_string()))
        }
    }
}

#[async_trait]
impl ReservationStore for InMemoryOrderStore {
    async fn upsert_reservation(&self, reservation: &Reservation) -> OrderResult<()> {
        self.ensure_available()?;
        let mut reservations = self.reservations.write().await;
        reservations.insert(reservation.order_id, reservation.clone());

        tracing::info!(order_id = %reservation.order_id, "Stored reservation");
        Ok(())
    }

    async fn get_reservation(&self, order_id: Uuid) -> OrderResult<Option<Reservation>> {
        self.ensure_available()?;
        let reservations = self.reservations.read().await;
        Ok(reservations.get(&order_id).cloned())
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryOrderStore {
    async fn record_confirmed_order(
        &self,
        date: NaiveDate,
        amount_cents: i64,
    ) -> OrderResult<DailyAggregate> {
        self.ensure_available()?;
        let mut daily = self.daily.write().await;

        let aggregate = daily.entry(date).or_insert_with(|| DailyAggregate {
            date,
            total_orders: 0,
            total_revenue_cents: 0,
            last_updated: Utc::now(),
        });
        let total_revenue_cents = aggregate
            .total_revenue_cents
            .checked_add(amount_cents)
            .ok_or_else(|| OrderError::InvalidPayload(format!("revenue for {date} overflows")))?;
        aggregate.total_orders += 1;
        aggregate.total_revenue_cents = total_revenue_cents;
        aggregate.last_updated = Utc::now();

        Ok(aggregate.clone())
    }

    async fn daily(&self, date: NaiveDate) -> OrderResult<Option<DailyAggregate>> {
        self.ensure_available()?;
        let daily = self.daily.read().await;
        Ok(daily.get(&date).cloned())
    }
}
