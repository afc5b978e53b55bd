//! End-to-end delivery behaviour through the in-memory broker.

use async_trait::async_trait;
use event_pipeline::{
    Broker, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    ConsumerConfig, DeadLetterAdmin, Event, EventConsumer, EventHandler, EventType, HandlerError,
    IdempotencyLedger, InMemoryBroker, InMemoryLedger, LAST_ERROR_HEADER, ORIGIN_QUEUE_HEADER,
    QueueRoute, TopicRouter, Topology,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Records when it was called and fails while `fail` is set.
struct RecordingHandler {
    fail: bool,
    calls: Mutex<Vec<Instant>>,
}

impl RecordingHandler {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        self.calls.lock().unwrap().push(Instant::now());
        if self.fail {
            Err(HandlerError::rejected("insufficient stock for FAIL-INV"))
        } else {
            Ok(())
        }
    }
}

async fn declared_router() -> (Arc<InMemoryBroker>, TopicRouter) {
    let broker = Arc::new(InMemoryBroker::new());
    let router = TopicRouter::new(
        broker.clone(),
        Topology::default()
            .with_route(QueueRoute::new("inventory", ["order.created"]))
            .with_route(QueueRoute::new("notifications", ["order.#"])),
    );
    router.declare().await.unwrap();
    (broker, router)
}

fn spawn_consumer(
    router: &TopicRouter,
    ledger: Arc<InMemoryLedger>,
    handler: Arc<RecordingHandler>,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let consumer = EventConsumer::for_role(
        router,
        "inventory",
        ledger,
        handler,
        ConsumerConfig::default(),
    )
    .unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        consumer.run(rx).await.unwrap();
    });
    (tx, task)
}

#[tokio::test(start_paused = true)]
async fn redelivered_event_is_acknowledged_without_rerunning_the_handler() {
    let (broker, router) = declared_router().await;
    let ledger = Arc::new(InMemoryLedger::new());
    let handler = RecordingHandler::new(false);
    let (shutdown, task) = spawn_consumer(&router, ledger.clone(), handler.clone());

    let event = Event::new(
        EventType::OrderCreated,
        Uuid::new_v4(),
        &json!({"order_id": "X", "items": [{"product_id": "P1", "quantity": 2}]}),
    )
    .unwrap();

    router.publisher().publish(&event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls().len(), 1);

    let key = format!("inventory:{}", event.idempotency_key());
    assert!(ledger.has_processed(&key).await.unwrap());

    // The transport delivers the same message again
    router.publisher().publish(&event).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls().len(), 1);
    assert_eq!(broker.queue_depth("q_inventory").await.unwrap(), 0);
    assert_eq!(broker.unacked_count("q_inventory"), 0);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_event_is_retried_with_backoff_then_dead_lettered() {
    let (broker, router) = declared_router().await;
    let handler = RecordingHandler::new(true);
    let (shutdown, task) = spawn_consumer(&router, Arc::new(InMemoryLedger::new()), handler.clone());

    let event = Event::new(
        EventType::OrderCreated,
        Uuid::new_v4(),
        &json!({"order_id": "Y", "items": [{"product_id": "FAIL-INV", "quantity": 1}]}),
    )
    .unwrap();
    router.publisher().publish(&event).await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    // Attempts 0, 1, 2 and 3, separated by 1s, 2s and 4s of backoff
    let calls = handler.calls();
    assert_eq!(calls.len(), 4);
    let offsets: Vec<u64> = calls
        .iter()
        .map(|at| at.duration_since(calls[0]).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 1, 3, 7]);

    assert_eq!(broker.queue_depth("q_inventory").await.unwrap(), 0);
    assert_eq!(broker.queue_depth("q_inventory.delay").await.unwrap(), 0);
    assert_eq!(broker.queue_depth("q_inventory.dlq").await.unwrap(), 1);

    let dead = broker.get("q_inventory.dlq").await.unwrap().unwrap();
    assert_eq!(dead.message.retries(), 3);
    assert_eq!(dead.message.header_str(ORIGIN_QUEUE_HEADER), Some("q_inventory"));
    assert!(dead.message.header_str(LAST_ERROR_HEADER).unwrap().contains("FAIL-INV"));
    assert_eq!(Event::from_slice(&dead.message.body).unwrap(), event);
    broker.nack(&dead.tag, true).await.unwrap();

    // Retries never fanned out to the other role
    assert_eq!(broker.queue_depth("q_notifications").await.unwrap(), 1);

    // Terminal until an operator replays it
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(handler.calls().len(), 4);
    let admin = DeadLetterAdmin::for_role(&router, "inventory").unwrap();
    assert_eq!(admin.replay(10).await.unwrap().replayed, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls().len(), 5);

    shutdown.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_three_failures_and_recovers_after_cooldown() {
    let breaker = CircuitBreaker::new(
        "slack",
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(30)),
    );
    let requests = AtomicU32::new(0);
    let status = Mutex::new(500u16);
    let (requests_seen, webhook_status) = (&requests, &status);

    let webhook = move || async move {
        requests_seen.fetch_add(1, Ordering::SeqCst);
        let code = *webhook_status.lock().unwrap();
        match code {
            200 => Ok(()),
            code => Err(format!("webhook returned {code}")),
        }
    };

    for _ in 0..3 {
        let result = breaker.call(webhook).await;
        assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(1)).await;
    let result = breaker.call(webhook).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(requests.load(Ordering::SeqCst), 3);

    *status.lock().unwrap() = 200;
    tokio::time::advance(Duration::from_secs(30)).await;
    breaker.call(webhook).await.unwrap();

    assert_eq!(requests.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}
