//! In-process broker with AMQP delivery semantics
//!
//! Everything lives behind one mutex that is never held across an await point.
//! Each consumer gets a pump task that moves ready messages into the consumer's
//! channel while it has fewer than `prefetch` unsettled deliveries. Message TTLs are
//! enforced by per-message timer tasks which dead-letter the message if it is still
//! waiting in the queue when the timer fires.

use super::{Broker, Delivery, DeliveryTag, ExchangeKind, Message, QueueArgs, Subscription};
use super::topic_matches;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

/// Name of the default exchange, which routes by queue name.
const DEFAULT_EXCHANGE: &str = "";

struct Stored {
    id: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message: Message,
}

struct Unacked {
    consumer: Option<u64>,
    entry: Stored,
}

struct ExchangeState {
    kind: ExchangeKind,
    // (binding key, queue)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    args: QueueArgs,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(args: QueueArgs) -> Self {
        Self {
            args,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn in_flight(&self, consumer: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer == Some(consumer))
            .count()
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer: u64,
    next_message: u64,
}

type Shared = Arc<Mutex<State>>;

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl State {
    /// Resolve the queues a publish reaches.
    fn resolve(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let ex = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for (key, queue) in &ex.bindings {
            let matched = match ex.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn route(
        &mut self,
        shared: &Shared,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<usize, BrokerError> {
        let targets = self.resolve(exchange, routing_key)?;
        if targets.is_empty() {
            warn!(exchange, routing_key, "Dropping unroutable message");
            return Ok(0);
        }

        for queue in &targets {
            self.next_message += 1;
            let stored = Stored {
                id: self.next_message,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                message: message.clone(),
            };
            self.enqueue(shared, queue, stored);
        }
        Ok(targets.len())
    }

    fn enqueue(&mut self, shared: &Shared, queue: &str, stored: Stored) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        let ttl = match (q.args.message_ttl, stored.message.expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(ttl) = ttl {
            spawn_expiry(Arc::downgrade(shared), queue.to_string(), stored.id, ttl);
        }

        trace!(queue, message_id = stored.id, "Enqueued message");
        q.ready.push_back(stored);
        q.notify.notify_waiters();
    }

    /// Re-publish a message through the queue's dead-letter exchange, if it has one.
    fn dead_letter(&mut self, shared: &Shared, queue: &str, entry: Stored) {
        let Some(args) = self.queues.get(queue).map(|q| q.args.clone()) else {
            return;
        };
        let Some(dlx) = args.dead_letter_exchange else {
            debug!(queue, "Discarding rejected message (no dead-letter exchange)");
            return;
        };

        let routing_key = args.dead_letter_routing_key.unwrap_or(entry.routing_key);
        let message = entry.message.with_expiration(None);
        if let Err(e) = self.route(shared, &dlx, &routing_key, message) {
            warn!(queue, dlx = %dlx, error = %e, "Failed to dead-letter message");
        }
    }

    fn expire(&mut self, shared: &Shared, queue: &str, id: u64) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = q.ready.iter().position(|s| s.id == id) else {
            return;
        };
        if let Some(entry) = q.ready.remove(pos) {
            trace!(queue, message_id = id, "Message expired");
            self.dead_letter(shared, queue, entry);
        }
    }

    fn take_for(&mut self, queue: &str, consumer: u64, prefetch: u16) -> Option<Delivery> {
        let tag = self.next_tag + 1;
        let q = self.queues.get_mut(queue)?;
        if prefetch > 0 && q.in_flight(consumer) >= prefetch as usize {
            return None;
        }
        let entry = q.ready.pop_front()?;
        self.next_tag = tag;

        let delivery = to_delivery(queue, tag, &entry);
        q.unacked.insert(
            tag,
            Unacked {
                consumer: Some(consumer),
                entry,
            },
        );
        Some(delivery)
    }

    /// Return every unsettled delivery of a consumer to the head of its queue.
    fn release_consumer(&mut self, queue: &str, consumer: u64) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        let mut tags: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == Some(consumer))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let count = tags.len();
        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = q.unacked.remove(&tag) {
                unacked.entry.redelivered = true;
                q.ready.push_front(unacked.entry);
            }
        }

        if count > 0 {
            debug!(queue, consumer, count, "Requeued unacknowledged deliveries");
            q.notify.notify_waiters();
        }
    }

    fn settle(&mut self, tag: &DeliveryTag) -> Result<Stored, BrokerError> {
        let q = self
            .queues
            .get_mut(&tag.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(tag.queue.clone()))?;
        let unacked = q
            .unacked
            .remove(&tag.id)
            .ok_or_else(|| BrokerError::UnknownDeliveryTag {
                queue: tag.queue.clone(),
                tag: tag.id,
            })?;
        // A prefetch slot just opened
        q.notify.notify_waiters();
        Ok(unacked.entry)
    }
}

fn to_delivery(queue: &str, tag: u64, entry: &Stored) -> Delivery {
    Delivery {
        tag: DeliveryTag {
            queue: queue.to_string(),
            id: tag,
        },
        exchange: entry.exchange.clone(),
        routing_key: entry.routing_key.clone(),
        redelivered: entry.redelivered,
        message: entry.message.clone(),
    }
}

fn spawn_expiry(shared: Weak<Mutex<State>>, queue: String, id: u64, ttl: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if let Some(shared) = shared.upgrade() {
            lock(&shared).expire(&shared, &queue, id);
        }
    });
}

async fn pump(
    shared: Weak<Mutex<State>>,
    queue: String,
    consumer: u64,
    prefetch: u16,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let Some(state) = shared.upgrade() else {
            return;
        };
        let notify = lock(&state).queues.get(&queue).map(|q| q.notify.clone());
        let Some(notify) = notify else {
            break;
        };

        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = lock(&state).take_for(&queue, consumer, prefetch);
        drop(state);

        match next {
            Some(delivery) => {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tx.closed() => break,
                }
            }
        }
    }

    if let Some(state) = shared.upgrade() {
        lock(&state).release_consumer(&queue, consumer);
    }
    debug!(queue = %queue, consumer, "Consumer cancelled");
}

/// In-process broker implementing exchanges, bindings, TTL and dead-lettering.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Shared,
    offline: Arc<AtomicBool>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (`false`) or regaining (`true`) the connection.
    ///
    /// While offline every operation fails with [`BrokerError::Closed`].
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_online()?;
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }

        let mut state = lock(&self.state);
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange '{}' exists with type {}", name, existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                debug!(exchange = name, kind = %kind, "Declared exchange");
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, args: QueueArgs) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let mut state = lock(&self.state);
        match state.queues.get(name) {
            Some(existing) if existing.args != args => Err(BrokerError::PreconditionFailed(
                format!("queue '{}' exists with different arguments", name),
            )),
            Some(_) => Ok(()),
            None => {
                debug!(queue = name, ttl = ?args.message_ttl, dlx = ?args.dead_letter_exchange, "Declared queue");
                state.queues.insert(name.to_string(), QueueState::new(args));
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let mut state = lock(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::PreconditionFailed(
                "cannot bind to the default exchange".to_string(),
            ));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !ex.bindings.contains(&binding) {
            debug!(queue, exchange, routing_key, "Bound queue");
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let mut state = lock(&self.state);
        state.route(&self.state, exchange, routing_key, message)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError> {
        self.ensure_online()?;
        let consumer = {
            let mut state = lock(&self.state);
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            state.next_consumer += 1;
            state.next_consumer
        };

        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        tokio::spawn(pump(
            Arc::downgrade(&self.state),
            queue.to_string(),
            consumer,
            prefetch,
            tx,
        ));

        debug!(queue, consumer, prefetch, "Started consumer");
        Ok(Subscription::new(queue, rx))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_online()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let Some(entry) = q.ready.pop_front() else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = to_delivery(queue, tag, &entry);
        q.unacked.insert(
            tag,
            Unacked {
                consumer: None,
                entry,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_online()?;
        lock(&self.state).settle(tag).map(|_| ())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let mut state = lock(&self.state);
        let mut entry = state.settle(tag)?;

        if requeue {
            entry.redelivered = true;
            if let Some(q) = state.queues.get_mut(&tag.queue) {
                q.ready.push_front(entry);
                q.notify.notify_waiters();
            }
        } else {
            state.dead_letter(&self.state, &tag.queue, entry);
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        self.ensure_online()?;
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        self.ensure_online()?;
        let mut state = lock(&self.state);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let purged = q.ready.len();
        q.ready.clear();
        Ok(purged)
    }

    async fn browse(&self, queue: &str, limit: usize) -> Result<Vec<Message>, BrokerError> {
        self.ensure_online()?;
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().take(limit).map(|s| s.message.clone()).collect())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn is_connected(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
