use async_trait::async_trait;
use event_pipeline::{Event, EventHandler, EventType, HandlerError};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::OrderError;
use crate::models::OrderConfirmed;
use crate::repository::{AnalyticsStore, ReservationStore};

/// Adds confirmed orders to the daily aggregate.
pub struct AnalyticsHandler {
    analytics: Arc<dyn AnalyticsStore>,
    reservations: Arc<dyn ReservationStore>,
}

impl AnalyticsHandler {
    pub fn new(analytics: Arc<dyn AnalyticsStore>, reservations: Arc<dyn ReservationStore>) -> Self {
        Self {
            analytics,
            reservations,
        }
    }

    async fn record(&self, event: &Event) -> Result<(), OrderError> {
        let confirmed: OrderConfirmed = event.payload()?;

        // Older producers do not carry the amount
        let amount_cents = match confirmed.amount_cents {
            Some(amount) => amount,
            None => {
                self.reservations
                    .get_reservation(confirmed.order_id)
                    .await?
                    .ok_or(OrderError::ReservationNotFound(confirmed.order_id))?
                    .amount_cents
            }
        };

        let date = event.occurred_on();
        let aggregate = self
            .analytics
            .record_confirmed_order(date, amount_cents)
            .await?;

        info!(
            order_id = %confirmed.order_id,
            %date,
            amount_cents,
            total_orders = aggregate.total_orders,
            total_revenue_cents = aggregate.total_revenue_cents,
            "Daily metrics updated"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AnalyticsHandler {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if event.event_type != EventType::OrderConfirmed {
            debug!(event_type = %event.event_type, "Ignoring event");
            return Ok(());
        }

        self.record(event).await.map_err(HandlerError::from)
    }
}
