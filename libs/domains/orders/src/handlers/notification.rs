use async_trait::async_trait;
use event_pipeline::{CircuitBreaker, CircuitBreakerError, Event, EventHandler, EventType, HandlerError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::OrderError;
use crate::models::{OrderFailed, OrderRef};
use crate::notifier::Notifier;

/// Chat message for an order event, if the event type is announced at all.
pub fn message_for(event: &Event) -> Result<Option<String>, OrderError> {
    // Unknown events may not carry an order id at all
    if event.event_type == EventType::Unknown {
        return Ok(None);
    }
    let order: OrderRef = event.payload()?;
    let id = order.order_id;

    let text = match event.event_type {
        EventType::OrderCreated => {
            format!("📦 *New order received*\nID: `{id}`\nStatus: *Processing inventory...*")
        }
        EventType::InventoryReserved => {
            format!("📋 *Stock reserved*\nID: `{id}`\nStatus: *Awaiting payment*")
        }
        EventType::OrderConfirmed => {
            format!("✅ *Order confirmed*\nID: `{id}`\nStatus: *Payment approved and stock reserved*")
        }
        EventType::OrderFailed => {
            let failed: OrderFailed = event.payload()?;
            format!("❌ *Order failed*\nID: `{id}`\nReason: {}", failed.reason)
        }
        EventType::Unknown => return Ok(None),
    };
    Ok(Some(text))
}

/// Announces order events on the chat webhook, behind a circuit breaker.
pub struct NotificationHandler {
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    emails_sent: AtomicU64,
}

impl NotificationHandler {
    pub fn new(notifier: Arc<dyn Notifier>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            notifier,
            breaker,
            emails_sent: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Customer e-mails sent so far
    pub fn emails_sent(&self) -> u64 {
        self.emails_sent.load(Ordering::Relaxed)
    }

    /// Customer e-mails are simulated and sent once the webhook call succeeded.
    fn email_customer(&self, event: &Event) {
        let subject = match event.event_type {
            EventType::OrderCreated => "order received",
            EventType::OrderConfirmed => "invoice",
            _ => return,
        };
        let customer = event
            .payload::<OrderRef>()
            .ok()
            .and_then(|order| order.customer_id)
            .unwrap_or_default();

        info!(customer_id = %customer, subject, "Sending e-mail to customer");
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let Some(text) = message_for(event)? else {
            debug!(event_type = %event.event_type, "No notification for event");
            return Ok(());
        };

        let notifier = self.notifier.clone();
        self.breaker
            .call(|| async move { notifier.notify(&text).await })
            .await
            .map_err(|e| match e {
                CircuitBreakerError::Open { name, .. } => HandlerError::CircuitOpen(name),
                CircuitBreakerError::Inner(err) => HandlerError::from(OrderError::Notifier(err)),
            })?;

        self.email_customer(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifierError;
    use crate::notifier::MockNotifier;
    use event_pipeline::{CircuitBreakerConfig, CircuitState};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn event(event_type: EventType) -> Event {
        let data = json!({"order_id": Uuid::new_v4(), "customer_id": "C-1", "reason": "no stock"});
        Event::new(event_type, Uuid::new_v4(), &data).unwrap()
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "slack",
            CircuitBreakerConfig::default().with_cooldown(Duration::from_secs(30)),
        ))
    }

    #[test]
    fn test_messages() {
        let created = message_for(&event(EventType::OrderCreated)).unwrap().unwrap();
        assert!(created.contains("New order received"));

        let failed = message_for(&event(EventType::OrderFailed)).unwrap().unwrap();
        assert!(failed.contains("no stock"));

        assert_eq!(message_for(&event(EventType::Unknown)).unwrap(), None);
    }

    #[test]
    fn test_message_requires_order_id() {
        let broken = Event::new(EventType::OrderCreated, Uuid::new_v4(), &json!({})).unwrap();
        assert!(matches!(message_for(&broken), Err(OrderError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_sends_one_webhook_call() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|text| text.contains("Order confirmed"))
            .times(1)
            .returning(|_| Ok(()));

        let handler = NotificationHandler::new(Arc::new(notifier), breaker());
        handler.handle(&event(EventType::OrderConfirmed)).await.unwrap();
        assert_eq!(handler.emails_sent(), 1);
    }

    #[tokio::test]
    async fn test_customer_is_emailed_once_across_webhook_retries() {
        let mut notifier = MockNotifier::new();
        let mut seq = mockall::Sequence::new();
        notifier
            .expect_notify()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(NotifierError::Transport("timeout".into())));
        notifier
            .expect_notify()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let handler = NotificationHandler::new(Arc::new(notifier), breaker());
        let created = event(EventType::OrderCreated);
        for _ in 0..2 {
            handler.handle(&created).await.unwrap_err();
            assert_eq!(handler.emails_sent(), 0);
        }
        handler.handle(&created).await.unwrap();
        assert_eq!(handler.emails_sent(), 1);
    }

    #[tokio::test]
    async fn test_status_updates_do_not_email_the_customer() {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().times(1).returning(|_| Ok(()));

        let handler = NotificationHandler::new(Arc::new(notifier), breaker());
        handler.handle(&event(EventType::InventoryReserved)).await.unwrap();
        assert_eq!(handler.emails_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_the_webhook() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .times(3)
            .returning(|_| Err(NotifierError::Status(500)));

        let handler = NotificationHandler::new(Arc::new(notifier), breaker());
        for _ in 0..3 {
            let err = handler.handle(&event(EventType::OrderCreated)).await.unwrap_err();
            assert!(matches!(err, HandlerError::Transient(_)));
        }
        assert_eq!(handler.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        let err = handler.handle(&event(EventType::OrderCreated)).await.unwrap_err();
        assert_eq!(err, HandlerError::CircuitOpen("slack".into()));
    }
}
