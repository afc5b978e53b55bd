use async_trait::async_trait;
use event_pipeline::{Event, EventHandler, EventPublisher, EventType, HandlerError};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::error::OrderError;
use crate::models::{
    InventoryReserved, OrderConfirmed, OrderCreated, OrderFailed, OrderRef, Reservation,
    STATUS_CONFIRMED,
};
use crate::repository::ReservationStore;
use crate::stock::StockCheck;

/// What the inventory role does after reserving stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum InventoryMode {
    /// Emit `InventoryReserved` only
    ReserveOnly,
    /// Also capture payment and emit `OrderConfirmed`
    #[default]
    ReserveAndConfirm,
}

/// Reserves stock for new orders.
pub struct InventoryHandler {
    stock: Arc<dyn StockCheck>,
    reservations: Arc<dyn ReservationStore>,
    publisher: EventPublisher,
    mode: InventoryMode,
}

impl InventoryHandler {
    pub fn new(
        stock: Arc<dyn StockCheck>,
        reservations: Arc<dyn ReservationStore>,
        publisher: EventPublisher,
        mode: InventoryMode,
    ) -> Self {
        Self {
            stock,
            reservations,
            publisher,
            mode,
        }
    }

    async fn reserve(&self, event: &Event) -> Result<(), OrderError> {
        let order: OrderCreated = event.payload()?;
        info!(
            order_id = %order.order_id,
            correlation_id = %event.correlation_id,
            items = order.items.len(),
            "Reserving inventory"
        );

        self.stock.check(&order.items).await?;

        let reservation = Reservation::for_order(&order)?;
        self.reservations.upsert_reservation(&reservation).await?;

        let reserved = event.follow_up(
            EventType::InventoryReserved,
            &InventoryReserved {
                order_id: order.order_id,
                customer_id: order.customer_id.clone(),
                amount_cents: reservation.amount_cents,
            },
        )?;
        self.publisher.publish(&reserved).await?;

        if self.mode == InventoryMode::ReserveAndConfirm {
            // Payment capture is simulated
            info!(
                order_id = %order.order_id,
                amount_cents = reservation.amount_cents,
                "Payment captured"
            );

            let confirmed = event.follow_up(
                EventType::OrderConfirmed,
                &OrderConfirmed {
                    order_id: order.order_id,
                    status: STATUS_CONFIRMED.to_string(),
                    customer_id: order.customer_id,
                    amount_cents: Some(reservation.amount_cents),
                },
            )?;
            self.publisher.publish(&confirmed).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for InventoryHandler {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if event.event_type != EventType::OrderCreated {
            debug!(event_type = %event.event_type, "Ignoring event");
            return Ok(());
        }

        self.reserve(event).await.map_err(HandlerError::from)
    }

    /// Announce that an order will not go through.
    async fn on_dead_letter(&self, event: &Event, error: &HandlerError) -> Result<(), HandlerError> {
        if event.event_type != EventType::OrderCreated {
            return Ok(());
        }

        let order: OrderRef = event.payload().map_err(OrderError::from)?;
        let failed = event
            .follow_up(
                EventType::OrderFailed,
                &OrderFailed {
                    order_id: order.order_id,
                    customer_id: order.customer_id.unwrap_or_default(),
                    reason: error.to_string(),
                },
            )
            .map_err(OrderError::from)?;

        self.publisher
            .publish(&failed)
            .await
            .map_err(OrderError::from)?;
        warn!(
            order_id = %order.order_id,
            correlation_id = %event.correlation_id,
            reason = %error,
            "Order failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderItem;
    use crate::repository::InMemoryOrderStore;
    use crate::stock::{MockStockCheck, SentinelStockCheck};
    use event_pipeline::{Broker, InMemoryBroker, QueueRoute, TopicRouter, Topology};
    use uuid::Uuid;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        store: InMemoryOrderStore,
        publisher: EventPublisher,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let router = TopicRouter::new(
            broker.clone(),
            Topology::default().with_route(QueueRoute::new("tap", ["order.#"])),
        );
        router.declare().await.unwrap();
        Fixture {
            broker,
            store: InMemoryOrderStore::new(),
            publisher: router.publisher(),
        }
    }

    fn order_created(product: &str) -> Event {
        let data = OrderCreated {
            order_id: Uuid::new_v4(),
            customer_id: "C-1".into(),
            items: vec![OrderItem::new(product, 2).with_unit_price(1_000)],
        };
        Event::new(EventType::OrderCreated, Uuid::new_v4(), &data).unwrap()
    }

    async fn emitted(broker: &InMemoryBroker) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(delivery) = broker.get("q_tap").await.unwrap() {
            events.push(Event::from_slice(&delivery.message.body).unwrap());
            broker.ack(&delivery.tag).await.unwrap();
        }
        events
    }

    #[tokio::test]
    async fn test_reserves_and_confirms() {
        let f = fixture().await;
        let handler = InventoryHandler::new(
            Arc::new(SentinelStockCheck::default()),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );
        let event = order_created("P1");
        let order: OrderCreated = event.payload().unwrap();

        handler.handle(&event).await.unwrap();

        let reservation = f.store.get_reservation(order.order_id).await.unwrap().unwrap();
        assert_eq!(reservation.amount_cents, 2_000);

        let events = emitted(&f.broker).await;
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::InventoryReserved, EventType::OrderConfirmed]);
        assert!(events.iter().all(|e| e.correlation_id == event.correlation_id));

        let confirmed: OrderConfirmed = events[1].payload().unwrap();
        assert_eq!(confirmed.status, "CONFIRMED");
        assert_eq!(confirmed.amount_cents, Some(2_000));
    }

    #[tokio::test]
    async fn test_rerun_emits_the_same_follow_up_ids() {
        let f = fixture().await;
        let handler = InventoryHandler::new(
            Arc::new(SentinelStockCheck::default()),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveOnly,
        );
        let event = order_created("P1");

        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        let events = emitted(&f.broker).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, events[1].event_id);
        assert_eq!(f.store.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn test_out_of_stock_is_a_rejection() {
        let f = fixture().await;
        let handler = InventoryHandler::new(
            Arc::new(SentinelStockCheck::default()),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );

        let err = handler.handle(&order_created("FAIL-INV")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(f.store.reservation_count().await, 0);
        assert!(emitted(&f.broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_unpriceable_order_is_malformed() {
        let f = fixture().await;
        let handler = InventoryHandler::new(
            Arc::new(SentinelStockCheck::default()),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );
        let data = OrderCreated {
            order_id: Uuid::new_v4(),
            customer_id: "C-1".into(),
            items: vec![OrderItem::new("P1", 2).with_unit_price(i64::MAX)],
        };
        let event = Event::new(EventType::OrderCreated, Uuid::new_v4(), &data).unwrap();

        let err = handler.handle(&event).await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert_eq!(f.store.reservation_count().await, 0);
        assert!(emitted(&f.broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_storage_error() {
        let f = fixture().await;
        let mut stock = MockStockCheck::new();
        stock.expect_check().times(1).returning(|_| Ok(()));
        f.store.set_available(false);

        let handler = InventoryHandler::new(
            Arc::new(stock),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );

        let err = handler.handle(&order_created("P1")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Storage(_)));
    }

    #[tokio::test]
    async fn test_other_event_types_are_ignored() {
        let f = fixture().await;
        let mut stock = MockStockCheck::new();
        stock.expect_check().never();

        let handler = InventoryHandler::new(
            Arc::new(stock),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );
        let event = Event::new(EventType::OrderConfirmed, Uuid::new_v4(), &serde_json::json!({})).unwrap();

        handler.handle(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_hook_emits_order_failed() {
        let f = fixture().await;
        let handler = InventoryHandler::new(
            Arc::new(SentinelStockCheck::default()),
            Arc::new(f.store.clone()),
            f.publisher.clone(),
            InventoryMode::ReserveAndConfirm,
        );
        let event = order_created("FAIL-INV");

        let error = HandlerError::rejected("Insufficient stock for product 'FAIL-INV'");
        handler.on_dead_letter(&event, &error).await.unwrap();

        let events = emitted(&f.broker).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::OrderFailed);
        let failed: OrderFailed = events[0].payload().unwrap();
        assert!(failed.reason.contains("FAIL-INV"));
        assert_eq!(failed.customer_id, "C-1");
    }
}
