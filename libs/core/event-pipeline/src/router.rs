//! Topic router
//!
//! Declares the broker topology ahead of consumption and publishes events by their
//! routing key. For each consumer role:
//!
//! | Queue | Bound to | Purpose |
//! |-------|----------|---------|
//! | `q_<role>` | events exchange: the role's binding keys and `retry.<role>` | main queue |
//! | `q_<role>.delay` | nothing (default exchange) | TTL-bound wait; expiry dead-letters to the events exchange with `retry.<role>` |
//! | `q_<role>.dlq` | dead-letter exchange: `<role>` | terminal failures |
//!
//! Retries come back on a role-specific key, so a retry for one role never fans
//! out to the other roles' queues.

use crate::broker::{Broker, ExchangeKind, QueueArgs};
use crate::envelope::Event;
use crate::error::{BrokerError, PipelineError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default name of the topic exchange carrying domain events
pub const DEFAULT_EVENTS_EXCHANGE: &str = "integrahub.events";

/// Default name of the direct exchange reserved for terminal failures
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "integrahub.dlx";

/// Queues and bindings of one consumer role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoute {
    role: String,
    bindings: Vec<String>,
}

impl QueueRoute {
    /// Create a route for `role` receiving the given binding keys.
    pub fn new<I, S>(role: impl Into<String>, bindings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: role.into(),
            bindings: bindings.into_iter().map(Into::into).collect(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Topic binding keys of the main queue.
    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    /// Main queue name.
    pub fn queue(&self) -> String {
        format!("q_{}", self.role)
    }

    /// Delay queue name.
    pub fn delay_queue(&self) -> String {
        format!("q_{}.delay", self.role)
    }

    /// Dead-letter queue name.
    pub fn dead_letter_queue(&self) -> String {
        format!("q_{}.dlq", self.role)
    }

    /// Routing key on which expired delay-queue messages return.
    pub fn retry_routing_key(&self) -> String {
        format!("retry.{}", self.role)
    }

    /// Routing key of this role on the dead-letter exchange.
    pub fn dead_letter_routing_key(&self) -> &str {
        &self.role
    }
}

/// Exchanges plus every role's queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    events_exchange: String,
    dead_letter_exchange: String,
    max_delay: Duration,
    routes: Vec<QueueRoute>,
}

impl Topology {
    /// Create a topology with no routes.
    pub fn new(events_exchange: impl Into<String>, dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            events_exchange: events_exchange.into(),
            dead_letter_exchange: dead_letter_exchange.into(),
            max_delay: Duration::from_secs(30),
            routes: Vec::new(),
        }
    }

    /// Add a role. A route with the same role replaces the earlier one.
    pub fn with_route(mut self, route: QueueRoute) -> Self {
        self.routes.retain(|r| r.role != route.role);
        self.routes.push(route);
        self
    }

    /// Set the delay queue TTL (the longest retry delay).
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn events_exchange(&self) -> &str {
        &self.events_exchange
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn routes(&self) -> &[QueueRoute] {
        &self.routes
    }

    /// Look up a role.
    pub fn route(&self, role: &str) -> Option<&QueueRoute> {
        self.routes.iter().find(|r| r.role == role)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_EXCHANGE, DEFAULT_DEAD_LETTER_EXCHANGE)
    }
}

/// Declares a [`Topology`] on a broker and hands out publishers.
#[derive(Clone)]
pub struct TopicRouter {
    broker: Arc<dyn Broker>,
    topology: Topology,
}

impl TopicRouter {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self { broker, topology }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Look up a role, failing with [`PipelineError::UnknownRole`].
    pub fn route(&self, role: &str) -> Result<&QueueRoute, PipelineError> {
        self.topology
            .route(role)
            .ok_or_else(|| PipelineError::UnknownRole(role.to_string()))
    }

    /// Declare exchanges, queues and bindings. Safe to call repeatedly.
    pub async fn declare(&self) -> Result<(), PipelineError> {
        let events = self.topology.events_exchange();
        let dlx = self.topology.dead_letter_exchange();

        self.broker
            .declare_exchange(events, ExchangeKind::Topic)
            .await?;
        self.broker
            .declare_exchange(dlx, ExchangeKind::Direct)
            .await?;

        for route in self.topology.routes() {
            self.declare_route(route).await?;
        }

        info!(
            events_exchange = events,
            dead_letter_exchange = dlx,
            roles = self.topology.routes().len(),
            "Declared broker topology"
        );
        Ok(())
    }

    async fn declare_route(&self, route: &QueueRoute) -> Result<(), BrokerError> {
        let events = self.topology.events_exchange();
        let dlx = self.topology.dead_letter_exchange();

        let queue = route.queue();
        self.broker
            .declare_queue(
                &queue,
                QueueArgs::durable()
                    .with_dead_letter(dlx, Some(route.dead_letter_routing_key().to_string())),
            )
            .await?;
        for key in route.bindings() {
            self.broker.bind_queue(&queue, events, key).await?;
        }
        self.broker
            .bind_queue(&queue, events, &route.retry_routing_key())
            .await?;

        self.broker
            .declare_queue(
                &route.delay_queue(),
                QueueArgs::durable()
                    .with_message_ttl(self.topology.max_delay())
                    .with_dead_letter(events, Some(route.retry_routing_key())),
            )
            .await?;

        let dlq = route.dead_letter_queue();
        self.broker.declare_queue(&dlq, QueueArgs::durable()).await?;
        self.broker
            .bind_queue(&dlq, dlx, route.dead_letter_routing_key())
            .await?;

        debug!(role = route.role(), queue = %queue, bindings = ?route.bindings(), "Declared role queues");
        Ok(())
    }

    /// Publisher for the events exchange.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.broker.clone(), self.topology.events_exchange())
    }
}

/// Publishes events to the topic exchange under their routing key.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish an event with `x-retries = 0`.
    pub async fn publish(&self, event: &Event) -> Result<(), PipelineError> {
        let message = event.to_message()?;
        self.broker
            .publish(&self.exchange, event.routing_key(), message)
            .await?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            routing_key = event.routing_key(),
            "Published event"
        );
        Ok(())
    }
}
