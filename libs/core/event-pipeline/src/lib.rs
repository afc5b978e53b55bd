//! Event Pipeline Framework
//!
//! Resilient consumption of domain events delivered by an AMQP-style broker.
//!
//! ## Features
//!
//! - **Idempotent dispatch**: an `IdempotencyLedger` remembers which events already
//!   produced their side effect, so redeliveries are acknowledged without re-running
//!   the handler
//! - **Delay-queue retries**: failed deliveries are republished to a TTL-bound delay
//!   queue whose expiry dead-letters them back into the topic exchange
//! - **Dead Letter Queue**: deliveries that exhausted their retries land in a
//!   per-role DLQ for operator inspection and replay
//! - **Circuit breaker**: protects a downstream call made from inside a handler
//! - **Topology router**: declares exchanges, queues and bindings idempotently
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Flow
//!
//! ```text
//! topic exchange ──order.created──> q_inventory ──> RetryableDispatcher ──> EventHandler
//!       ^                                                 │
//!       │ (TTL expiry, retry.inventory)                   ├─ ok ──────> ledger + ack
//!       └──────────── q_inventory.delay <─── attempt<max ─┤
//!                                                          └─ attempt>=max ──> dlx ──> q_inventory.dlq
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use event_pipeline::{
//!     ConsumerConfig, EventConsumer, InMemoryBroker, InMemoryLedger, QueueRoute, Topology, TopicRouter,
//! };
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let topology = Topology::new("integrahub.events", "integrahub.dlx")
//!     .with_route(QueueRoute::new("inventory", ["order.created"]));
//! let router = TopicRouter::new(broker.clone(), topology);
//! router.declare().await?;
//!
//! let consumer = EventConsumer::for_role(&router, "inventory", ledger, handler, ConsumerConfig::default())?;
//! consumer.run(shutdown_rx).await?;
//! ```

pub mod broker;
mod config;
mod consumer;
mod dispatcher;
mod dlq;
mod envelope;
mod error;
mod health;
pub mod ledger;
pub mod metrics;
mod resilience;
mod retry;
mod router;

// Re-export main types
pub use broker::{
    Broker, Delivery, DeliveryTag, ExchangeKind, Headers, InMemoryBroker, Message, QueueArgs,
    Subscription, topic_matches,
};
#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;
pub use config::ConsumerConfig;
pub use consumer::EventConsumer;
pub use dispatcher::{DispatchOutcome, DispatcherConfig, EventHandler, RetryableDispatcher};
pub use dlq::{DeadLetterAdmin, DeadLetterEntry, DlqStats, ReplayReport};
pub use envelope::{
    CONTENT_TYPE_JSON, Event, EventType, LAST_ERROR_HEADER, ORIGIN_QUEUE_HEADER, RETRIES_HEADER,
};
pub use error::{BrokerError, ErrorCategory, HandlerError, LedgerError, PipelineError};
pub use health::{HealthResponse, HealthState, admin_router, health_router};
pub use ledger::{IdempotencyLedger, InMemoryLedger};
pub use metrics::{PipelineMetrics, init_metrics, render_metrics};
pub use resilience::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use retry::{RejectionPolicy, RetryDecision, RetryPolicy};
pub use router::{
    DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_EVENTS_EXCHANGE, EventPublisher, QueueRoute, TopicRouter,
    Topology,
};
