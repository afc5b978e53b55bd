//! Order intake: validate, build `OrderCreated`, publish.

use event_pipeline::{Event, EventPublisher, EventType};
use tracing::{error, info};
use uuid::Uuid;
use validator::Validate;

use crate::error::GatewayError;
use crate::models::{OrderAccepted, OrderCreated, OrderRequest, STATUS_PROCESSING};

/// Accepts orders and hands them to the pipeline.
#[derive(Clone)]
pub struct OrderGateway {
    publisher: EventPublisher,
}

impl OrderGateway {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    /// Publish a validated `OrderCreated`.
    ///
    /// Nothing is published for an invalid request; a publish failure is returned to
    /// the caller.
    pub async fn submit(&self, request: OrderRequest) -> Result<OrderAccepted, GatewayError> {
        request
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let order_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let data = OrderCreated {
            order_id,
            customer_id: request.customer_id,
            items: request.items,
        };

        let event = Event::new(EventType::OrderCreated, correlation_id, &data)
            .map_err(|e| GatewayError::Publish(e.to_string()))?;

        self.publisher.publish(&event).await.map_err(|e| {
            error!(%order_id, %correlation_id, error = %e, "Failed to publish order");
            GatewayError::Publish(e.to_string())
        })?;

        info!(%order_id, %correlation_id, "Order accepted");
        Ok(OrderAccepted {
            order_id,
            correlation_id,
            status: STATUS_PROCESSING.to_string(),
        })
    }
}
