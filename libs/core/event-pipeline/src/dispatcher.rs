//! Handler trait and the retrying, idempotent dispatcher.
//!
//! For each delivery:
//! 1. Decode the envelope and read `x-retries` (0 when absent).
//! 2. Already in the ledger: acknowledge, skip the handler.
//! 3. Otherwise run the handler.
//! 4. Success: record the key, then acknowledge.
//! 5. Failure: either republish to the delay queue with `x-retries + 1` and a
//!    per-message expiration, or publish to the dead-letter exchange; then
//!    acknowledge the original.
//!
//! If the republish itself fails the original is rejected with requeue, so a
//! failed delivery is never acknowledged without having been forwarded.

use crate::broker::{Broker, Delivery};
use crate::envelope::{Event, LAST_ERROR_HEADER, ORIGIN_QUEUE_HEADER, RETRIES_HEADER};
use crate::error::HandlerError;
use crate::ledger::IdempotencyLedger;
use crate::metrics::PipelineMetrics;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::router::{QueueRoute, Topology};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Business logic run for each new event.
///
/// # Example
///
/// ```rust,ignore
/// use event_pipeline::{Event, EventHandler, HandlerError};
///
/// struct AuditHandler;
///
/// #[async_trait]
/// impl EventHandler for AuditHandler {
///     fn name(&self) -> &'static str {
///         "audit"
///     }
///
///     async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
///         tracing::info!(event_type = %event.event_type, "audited");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &'static str;

    /// Apply the event's side effect.
    ///
    /// Must be idempotent with respect to the event: it may run more than once for
    /// the same event when a crash happens between the side effect and the ledger
    /// write.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;

    /// Called once after the event was dead-lettered.
    ///
    /// Errors are logged and otherwise ignored.
    async fn on_dead_letter(&self, _event: &Event, _error: &HandlerError) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Result of dispatching one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; key recorded and delivery acknowledged
    Processed,
    /// Key already recorded; acknowledged without running the handler
    Duplicate,
    /// Republished to the delay queue carrying `attempt` as `x-retries`
    Retried { attempt: u32, delay: Duration },
    /// Routed to the DLQ after failing on `attempt`
    DeadLettered { attempt: u32 },
    /// Could not be forwarded; returned to the queue for redelivery
    Requeued,
}

impl DispatchOutcome {
    /// Label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Processed => "processed",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::Retried { .. } => "retried",
            DispatchOutcome::DeadLettered { .. } => "dead_lettered",
            DispatchOutcome::Requeued => "requeued",
        }
    }
}

/// Where a dispatcher forwards failed deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Consumer role; namespaces ledger keys
    pub role: String,

    /// Main queue the deliveries come from
    pub queue: String,

    /// Delay queue for retries (published through the default exchange)
    pub delay_queue: String,

    /// Exchange receiving terminal failures
    pub dead_letter_exchange: String,

    /// Routing key on the dead-letter exchange
    pub dead_letter_routing_key: String,

    /// Retry budget and backoff
    pub retry: RetryPolicy,
}

impl DispatcherConfig {
    /// Derive the configuration of one role from the topology.
    pub fn for_route(topology: &Topology, route: &QueueRoute) -> Self {
        Self {
            role: route.role().to_string(),
            queue: route.queue(),
            delay_queue: route.delay_queue(),
            dead_letter_exchange: topology.dead_letter_exchange().to_string(),
            dead_letter_routing_key: route.dead_letter_routing_key().to_string(),
            retry: RetryPolicy::default().with_max_delay(topology.max_delay()),
        }
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Wraps a handler with the ledger check, retry and dead-letter routing.
pub struct RetryableDispatcher<H: ?Sized> {
    broker: Arc<dyn Broker>,
    ledger: Arc<dyn IdempotencyLedger>,
    handler: Arc<H>,
    config: DispatcherConfig,
    metrics: PipelineMetrics,
}

impl<H> RetryableDispatcher<H>
where
    H: EventHandler + ?Sized,
{
    pub fn new(
        broker: Arc<dyn Broker>,
        ledger: Arc<dyn IdempotencyLedger>,
        handler: Arc<H>,
        config: DispatcherConfig,
    ) -> Self {
        let metrics = PipelineMetrics::new(&config.role, &config.queue);
        Self {
            broker,
            ledger,
            handler,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Ledger key of an event for this role.
    pub fn ledger_key(&self, event: &Event) -> String {
        format!("{}:{}", self.config.role, event.idempotency_key())
    }

    /// Process one delivery to completion. Never fails: every error becomes a
    /// retry, a dead letter or a requeue.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let started = Instant::now();
        self.metrics.received();

        let outcome = self.dispatch_inner(&delivery).await;

        self.metrics.processed(outcome.label(), started.elapsed());
        outcome
    }

    async fn dispatch_inner(&self, delivery: &Delivery) -> DispatchOutcome {
        let attempt = delivery.message.retries();

        let event = match Event::from_slice(&delivery.message.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    role = %self.config.role,
                    delivery_tag = delivery.tag.id,
                    error = %e,
                    "Undecodable delivery body"
                );
                return self.fail(delivery, None, attempt, e.into()).await;
            }
        };

        let key = self.ledger_key(&event);
        match self.ledger.has_processed(&key).await {
            Ok(true) => {
                info!(
                    role = %self.config.role,
                    event_id = %event.event_id,
                    correlation_id = %event.correlation_id,
                    redelivered = delivery.redelivered,
                    "Event already processed, skipping"
                );
                self.metrics.duplicate();
                self.ack(delivery).await;
                return DispatchOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => return self.fail(delivery, Some(&event), attempt, e.into()).await,
        }

        debug!(
            role = %self.config.role,
            handler = self.handler.name(),
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            attempt,
            "Handling event"
        );

        let result = AssertUnwindSafe(self.handler.handle(&event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::transient(format!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                )))
            });

        if let Err(e) = result {
            return self.fail(delivery, Some(&event), attempt, e).await;
        }

        if let Err(e) = self.ledger.mark_processed(&key).await {
            return self.fail(delivery, Some(&event), attempt, e.into()).await;
        }

        self.ack(delivery).await;
        info!(
            role = %self.config.role,
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            attempt,
            "Event processed"
        );
        DispatchOutcome::Processed
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        event: Option<&Event>,
        attempt: u32,
        error: HandlerError,
    ) -> DispatchOutcome {
        self.metrics.handler_failed(error.kind());
        let correlation_id = event.map(|e| e.correlation_id.to_string()).unwrap_or_default();

        match self.config.retry.decide(attempt, &error) {
            RetryDecision::RetryWithDelay(delay) => {
                let next = attempt + 1;
                let message = delivery
                    .message
                    .clone()
                    .with_header(RETRIES_HEADER, next)
                    .with_expiration(Some(delay));

                if let Err(e) = self
                    .broker
                    .publish("", &self.config.delay_queue, message)
                    .await
                {
                    error!(
                        role = %self.config.role,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to schedule retry, requeueing delivery"
                    );
                    return self.requeue(delivery).await;
                }

                warn!(
                    role = %self.config.role,
                    correlation_id = %correlation_id,
                    attempt = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Handler failed, retry scheduled"
                );
                self.metrics.retried(next);
                self.ack(delivery).await;
                DispatchOutcome::Retried {
                    attempt: next,
                    delay,
                }
            }
            RetryDecision::DeadLetter => {
                let message = delivery
                    .message
                    .clone()
                    .with_expiration(None)
                    .with_header(LAST_ERROR_HEADER, error.to_string())
                    .with_header(ORIGIN_QUEUE_HEADER, self.config.queue.as_str());

                if let Err(e) = self
                    .broker
                    .publish(
                        &self.config.dead_letter_exchange,
                        &self.config.dead_letter_routing_key,
                        message,
                    )
                    .await
                {
                    error!(
                        role = %self.config.role,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to dead-letter, requeueing delivery"
                    );
                    return self.requeue(delivery).await;
                }

                error!(
                    role = %self.config.role,
                    correlation_id = %correlation_id,
                    attempt,
                    error = %error,
                    "Retries exhausted, event dead-lettered"
                );
                self.metrics.dead_lettered();

                if let Some(event) = event {
                    if let Err(e) = self.handler.on_dead_letter(event, &error).await {
                        warn!(
                            role = %self.config.role,
                            correlation_id = %correlation_id,
                            error = %e,
                            "Dead-letter hook failed"
                        );
                    }
                }

                self.ack(delivery).await;
                DispatchOutcome::DeadLettered { attempt }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(&delivery.tag).await {
            error!(
                role = %self.config.role,
                delivery_tag = delivery.tag.id,
                error = %e,
                "Failed to ACK delivery"
            );
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> DispatchOutcome {
        if let Err(e) = self.broker.nack(&delivery.tag, true).await {
            error!(
                role = %self.config.role,
                delivery_tag = delivery.tag.id,
                error = %e,
                "Failed to NACK delivery"
            );
        }
        DispatchOutcome::Requeued
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::envelope::EventType;
    use crate::ledger::InMemoryLedger;
    use crate::router::TopicRouter;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        error: HandlerError,
        dead_letters: Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(failures: u32, error: HandlerError) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                error,
                dead_letters: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }

        async fn on_dead_letter(&self, event: &Event, error: &HandlerError) -> Result<(), HandlerError> {
            self.dead_letters
                .lock()
                .unwrap()
                .push(format!("{}:{}", event.event_type, error));
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            panic!("boom");
        }
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        ledger: Arc<InMemoryLedger>,
        topology: Topology,
    }

    impl Fixture {
        async fn new() -> Self {
            let broker = Arc::new(InMemoryBroker::new());
            let topology =
                Topology::default().with_route(QueueRoute::new("inventory", ["order.created"]));
            TopicRouter::new(broker.clone(), topology.clone())
                .declare()
                .await
                .unwrap();
            Self {
                broker,
                ledger: Arc::new(InMemoryLedger::new()),
                topology,
            }
        }

        fn dispatcher<H: EventHandler>(&self, handler: Arc<H>) -> RetryableDispatcher<H> {
            let route = self.topology.route("inventory").unwrap();
            RetryableDispatcher::new(
                self.broker.clone(),
                self.ledger.clone(),
                handler,
                DispatcherConfig::for_route(&self.topology, route),
            )
        }

        async fn publish(&self, event: &Event) {
            TopicRouter::new(self.broker.clone(), self.topology.clone())
                .publisher()
                .publish(event)
                .await
                .unwrap();
        }

        async fn next(&self, queue: &str) -> Delivery {
            self.broker.get(queue).await.unwrap().unwrap()
        }
    }

    fn order_created() -> Event {
        Event::new(
            EventType::OrderCreated,
            Uuid::new_v4(),
            &json!({"order_id": "o-1", "customer_id": "c-1", "items": []}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_records_ledger_and_acks() {
        let fx = Fixture::new().await;
        let handler = Arc::new(FlakyHandler::new(0, HandlerError::transient("x")));
        let dispatcher = fx.dispatcher(handler.clone());

        let event = order_created();
        fx.publish(&event).await;
        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;

        assert_eq!(outcome, DispatchOutcome::Processed);
        assert!(fx.ledger.processed_at(&dispatcher.ledger_key(&event)).is_some());
        assert_eq!(fx.broker.unacked_count("q_inventory"), 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_skips_handler() {
        let fx = Fixture::new().await;
        let handler = Arc::new(FlakyHandler::new(0, HandlerError::transient("x")));
        let dispatcher = fx.dispatcher(handler.clone());

        let event = order_created();
        fx.publish(&event).await;
        fx.publish(&event).await;

        let first = dispatcher.dispatch(fx.next("q_inventory").await).await;
        let second = dispatcher.dispatch(fx.next("q_inventory").await).await;

        assert_eq!(first, DispatchOutcome::Processed);
        assert_eq!(second, DispatchOutcome::Duplicate);
        assert_eq!(handler.calls(), 1);
        assert_eq!(fx.broker.unacked_count("q_inventory"), 0);
    }

    #[tokio::test]
    async fn test_failure_below_budget_republishes_once() {
        let fx = Fixture::new().await;
        let handler = Arc::new(FlakyHandler::new(1, HandlerError::transient("timeout")));
        let dispatcher = fx.dispatcher(handler);

        let event = order_created();
        fx.publish(&event).await;
        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Retried {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(fx.broker.unacked_count("q_inventory"), 0);
        assert_eq!(fx.broker.queue_depth("q_inventory.delay").await.unwrap(), 1);
        assert_eq!(fx.broker.queue_depth("q_inventory.dlq").await.unwrap(), 0);

        let retry = fx.next("q_inventory.delay").await;
        assert_eq!(retry.message.retries(), 1);
        assert_eq!(retry.message.expiration, Some(Duration::from_secs(1)));
        assert_eq!(Event::from_slice(&retry.message.body).unwrap(), event);
        assert!(fx.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_failure_at_budget_dead_letters_once() {
        let fx = Fixture::new().await;
        let handler = Arc::new(FlakyHandler::new(u32::MAX, HandlerError::rejected("no stock")));
        let dispatcher = fx.dispatcher(handler.clone());

        let event = order_created();
        let message = event.to_message().unwrap().with_header(RETRIES_HEADER, 3);
        fx.broker.publish("", "q_inventory", message).await.unwrap();

        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;
        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempt: 3 });
        assert_eq!(fx.broker.queue_depth("q_inventory.delay").await.unwrap(), 0);

        let dead = fx.next("q_inventory.dlq").await;
        assert_eq!(dead.message.retries(), 3);
        assert_eq!(Event::from_slice(&dead.message.body).unwrap(), event);
        assert_eq!(dead.message.header_str(ORIGIN_QUEUE_HEADER), Some("q_inventory"));
        assert!(
            dead.message
                .header_str(LAST_ERROR_HEADER)
                .is_some_and(|e| e.contains("no stock"))
        );
        assert_eq!(handler.dead_letters.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_dead_lettered_after_budget() {
        let fx = Fixture::new().await;
        let dispatcher = fx.dispatcher(Arc::new(FlakyHandler::new(0, HandlerError::transient("x"))));

        let message = crate::broker::Message::json(b"{not json".to_vec()).with_header(RETRIES_HEADER, 3);
        fx.broker.publish("", "q_inventory", message).await.unwrap();

        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;
        assert_eq!(outcome, DispatchOutcome::DeadLettered { attempt: 3 });
        assert_eq!(fx.broker.queue_depth("q_inventory.dlq").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ledger_outage_aborts_attempt() {
        let fx = Fixture::new().await;
        let handler = Arc::new(FlakyHandler::new(0, HandlerError::transient("x")));
        let dispatcher = fx.dispatcher(handler.clone());
        fx.ledger.set_available(false);

        fx.publish(&order_created()).await;
        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;

        assert!(matches!(outcome, DispatchOutcome::Retried { attempt: 1, .. }));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_requeues_instead_of_acking() {
        let fx = Fixture::new().await;
        let dispatcher = fx.dispatcher(Arc::new(FlakyHandler::new(1, HandlerError::transient("x"))));

        fx.publish(&order_created()).await;
        let delivery = fx.next("q_inventory").await;

        // Broker drops between handler failure and republish: settle fails too,
        // the delivery stays unacked and is redelivered on reconnect
        fx.broker.set_online(false);
        let outcome = dispatcher.dispatch(delivery).await;
        fx.broker.set_online(true);

        assert_eq!(outcome, DispatchOutcome::Requeued);
        assert_eq!(fx.broker.queue_depth("q_inventory.delay").await.unwrap(), 0);
        assert_eq!(fx.broker.unacked_count("q_inventory"), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_treated_as_transient() {
        let fx = Fixture::new().await;
        let dispatcher = fx.dispatcher(Arc::new(PanickingHandler));

        fx.publish(&order_created()).await;
        let outcome = dispatcher.dispatch(fx.next("q_inventory").await).await;

        assert!(matches!(outcome, DispatchOutcome::Retried { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_role_and_type() {
        let fx = Fixture::new().await;
        let dispatcher = fx.dispatcher(Arc::new(FlakyHandler::new(0, HandlerError::transient("x"))));

        let created = order_created();
        let confirmed = created.follow_up(EventType::OrderConfirmed, &json!({})).unwrap();

        assert_eq!(
            dispatcher.ledger_key(&created),
            format!("inventory:OrderCreated:{}", created.correlation_id)
        );
        assert_ne!(dispatcher.ledger_key(&created), dispatcher.ledger_key(&confirmed));
    }
}
