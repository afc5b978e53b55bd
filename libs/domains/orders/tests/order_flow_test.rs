//! Order flows through every role on the in-memory broker.

use async_trait::async_trait;
use domain_orders::*;
use event_pipeline::{
    Broker, DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_EVENTS_EXCHANGE, Event, EventType,
    IdempotencyLedger, InMemoryBroker, InMemoryLedger, QueueRoute, TopicRouter,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifierError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    ledger: Arc<InMemoryLedger>,
    store: InMemoryOrderStore,
    notifier: Arc<RecordingNotifier>,
    pipeline: OrderPipeline,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        // An extra audit queue sees every event for state verification
        let topology = order_topology(DEFAULT_EVENTS_EXCHANGE, DEFAULT_DEAD_LETTER_EXCHANGE)
            .with_route(QueueRoute::new("audit", ["order.#"]));
        let router = TopicRouter::new(broker.clone(), topology);
        router.declare().await.unwrap();

        let ledger = Arc::new(InMemoryLedger::new());
        let store = InMemoryOrderStore::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = OrderPipeline::new(router, ledger.clone())
            .with_reservation_store(Arc::new(store.clone()))
            .with_analytics_store(Arc::new(store.clone()))
            .with_notifier(notifier.clone());

        let (shutdown, rx) = watch::channel(false);
        let running = pipeline.clone();
        let task = tokio::spawn(async move {
            running.run(&ConsumerRole::all(), rx).await.unwrap();
        });

        Self {
            broker,
            ledger,
            store,
            notifier,
            pipeline,
            shutdown,
            task,
        }
    }

    async fn audit_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(delivery) = self.broker.get("q_audit").await.unwrap() {
            events.push(Event::from_slice(&delivery.message.body).unwrap());
            self.broker.ack(&delivery.tag).await.unwrap();
        }
        events
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap();
    }
}

fn request(product_id: &str) -> OrderRequest {
    OrderRequest {
        customer_id: "C-42".into(),
        items: vec![OrderItem::new(product_id, 2).with_unit_price(1_500)],
    }
}

#[tokio::test(start_paused = true)]
async fn order_is_reserved_confirmed_and_counted_once() {
    let harness = Harness::start().await;

    let accepted = harness.pipeline.gateway().submit(request("P1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = harness.audit_events().await;
    let timeline = OrderTimeline::from_events(&events);
    assert_eq!(timeline.state(accepted.correlation_id), Some(OrderState::Confirmed));

    let reservation = harness
        .store
        .get_reservation(accepted.order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.amount_cents, 3_000);

    let key = format!("inventory:OrderCreated:{}", accepted.correlation_id);
    assert!(harness.ledger.has_processed(&key).await.unwrap());

    let today = events
        .iter()
        .find(|e| e.event_type == EventType::OrderConfirmed)
        .unwrap()
        .occurred_on();
    let daily = harness.store.daily(today).await.unwrap().unwrap();
    assert_eq!(daily.total_orders, 1);
    assert_eq!(daily.total_revenue_cents, 3_000);

    // Created, reserved and confirmed are each announced once
    assert_eq!(harness.notifier.sent().len(), 3);

    // Redeliver the original OrderCreated: nothing happens downstream
    let created = events
        .iter()
        .find(|e| e.event_type == EventType::OrderCreated)
        .unwrap();
    harness.pipeline.router().publisher().publish(created).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let replayed = harness.audit_events().await;
    assert_eq!(replayed.len(), 1, "only the redelivered event itself");
    assert_eq!(harness.store.reservation_count().await, 1);
    assert_eq!(harness.notifier.sent().len(), 3);
    assert_eq!(
        harness.store.daily(today).await.unwrap().unwrap().total_orders,
        1
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_stock_order_is_dead_lettered_and_marked_failed() {
    let harness = Harness::start().await;

    let accepted = harness
        .pipeline
        .gateway()
        .submit(request("FAIL-INV"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(harness.broker.queue_depth("q_inventory.dlq").await.unwrap(), 1);
    let dead = harness.broker.get("q_inventory.dlq").await.unwrap().unwrap();
    assert_eq!(dead.message.retries(), 3);
    harness.broker.nack(&dead.tag, true).await.unwrap();

    let events = harness.audit_events().await;
    let timeline = OrderTimeline::from_events(&events);
    assert_eq!(timeline.state(accepted.correlation_id), Some(OrderState::Failed));
    assert_eq!(harness.store.reservation_count().await, 0);

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].contains("Order failed"));
    assert!(sent[1].contains("FAIL-INV"));

    harness.stop().await;
}
