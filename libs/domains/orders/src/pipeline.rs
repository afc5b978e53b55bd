//! Consumer roles and their wiring.
//!
//! | role            | queue             | bindings          |
//! |-----------------|-------------------|-------------------|
//! | `inventory`     | `q_inventory`     | `order.created`   |
//! | `notifications` | `q_notifications` | `order.#`         |
//! | `analytics`     | `q_analytics`     | `order.confirmed` |

use async_trait::async_trait;
use event_pipeline::{
    CircuitBreaker, CircuitBreakerConfig, ConsumerConfig, Event, EventConsumer, EventHandler,
    HandlerError, IdempotencyLedger, PipelineError, QueueRoute, TopicRouter, Topology,
};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::gateway::OrderGateway;
use crate::handlers::{AnalyticsHandler, InventoryHandler, InventoryMode, NotificationHandler};
use crate::notifier::{LogNotifier, Notifier};
use crate::repository::{AnalyticsStore, InMemoryOrderStore, ReservationStore};
use crate::stock::{SentinelStockCheck, StockCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerRole {
    Inventory,
    Notifications,
    Analytics,
}

impl ConsumerRole {
    pub fn bindings(&self) -> &'static [&'static str] {
        match self {
            ConsumerRole::Inventory => &["order.created"],
            ConsumerRole::Notifications => &["order.#"],
            ConsumerRole::Analytics => &["order.confirmed"],
        }
    }

    pub fn route(&self) -> QueueRoute {
        QueueRoute::new(self.as_ref(), self.bindings().iter().copied())
    }

    pub fn all() -> Vec<ConsumerRole> {
        ConsumerRole::iter().collect()
    }
}

/// Topology with every order role declared.
pub fn order_topology(events_exchange: &str, dead_letter_exchange: &str) -> Topology {
    ConsumerRole::iter().fold(
        Topology::new(events_exchange, dead_letter_exchange),
        |topology, role| topology.with_route(role.route()),
    )
}

/// The handler of one role.
pub enum RoleHandler {
    Inventory(InventoryHandler),
    Notifications(NotificationHandler),
    Analytics(AnalyticsHandler),
}

#[async_trait]
impl EventHandler for RoleHandler {
    fn name(&self) -> &'static str {
        match self {
            RoleHandler::Inventory(h) => h.name(),
            RoleHandler::Notifications(h) => h.name(),
            RoleHandler::Analytics(h) => h.name(),
        }
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match self {
            RoleHandler::Inventory(h) => h.handle(event).await,
            RoleHandler::Notifications(h) => h.handle(event).await,
            RoleHandler::Analytics(h) => h.handle(event).await,
        }
    }

    async fn on_dead_letter(&self, event: &Event, error: &HandlerError) -> Result<(), HandlerError> {
        match self {
            RoleHandler::Inventory(h) => h.on_dead_letter(event, error).await,
            RoleHandler::Notifications(h) => h.on_dead_letter(event, error).await,
            RoleHandler::Analytics(h) => h.on_dead_letter(event, error).await,
        }
    }
}

/// Everything the order roles need, wired once at startup.
///
/// ```rust,ignore
/// let router = TopicRouter::new(broker, order_topology(DEFAULT_EVENTS_EXCHANGE, DEFAULT_DEAD_LETTER_EXCHANGE));
/// router.declare().await?;
///
/// let pipeline = OrderPipeline::new(router, Arc::new(InMemoryLedger::new()))
///     .with_notifier(Arc::new(SlackWebhookNotifier::new(url)?));
/// pipeline.run(&ConsumerRole::all(), shutdown_rx).await?;
/// ```
#[derive(Clone)]
pub struct OrderPipeline {
    router: TopicRouter,
    ledger: Arc<dyn IdempotencyLedger>,
    reservations: Arc<dyn ReservationStore>,
    analytics: Arc<dyn AnalyticsStore>,
    stock: Arc<dyn StockCheck>,
    notifier: Arc<dyn Notifier>,
    breaker: Arc<CircuitBreaker>,
    inventory_mode: InventoryMode,
    consumer_config: ConsumerConfig,
}

impl OrderPipeline {
    /// Pipeline with in-memory stores, the sentinel stock check and a logging notifier.
    pub fn new(router: TopicRouter, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        let store = InMemoryOrderStore::new();
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let breaker = Arc::new(CircuitBreaker::new(
            notifier.name(),
            CircuitBreakerConfig::default(),
        ));

        Self {
            router,
            ledger,
            reservations: Arc::new(store.clone()),
            analytics: Arc::new(store),
            stock: Arc::new(SentinelStockCheck::default()),
            notifier,
            breaker,
            inventory_mode: InventoryMode::default(),
            consumer_config: ConsumerConfig::default(),
        }
    }

    pub fn with_reservation_store(mut self, store: Arc<dyn ReservationStore>) -> Self {
        self.reservations = store;
        self
    }

    pub fn with_analytics_store(mut self, store: Arc<dyn AnalyticsStore>) -> Self {
        self.analytics = store;
        self
    }

    pub fn with_stock_check(mut self, stock: Arc<dyn StockCheck>) -> Self {
        self.stock = stock;
        self
    }

    /// Replace the notifier; the breaker is renamed after it and reset.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(
            notifier.name(),
            self.breaker.config().clone(),
        ));
        self.notifier = notifier;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(self.notifier.name(), config));
        self
    }

    pub fn with_inventory_mode(mut self, mode: InventoryMode) -> Self {
        self.inventory_mode = mode;
        self
    }

    pub fn with_consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Breaker protecting the notifier.
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn gateway(&self) -> OrderGateway {
        OrderGateway::new(self.router.publisher())
    }

    pub fn handler(&self, role: ConsumerRole) -> RoleHandler {
        match role {
            ConsumerRole::Inventory => RoleHandler::Inventory(InventoryHandler::new(
                self.stock.clone(),
                self.reservations.clone(),
                self.router.publisher(),
                self.inventory_mode,
            )),
            ConsumerRole::Notifications => RoleHandler::Notifications(NotificationHandler::new(
                self.notifier.clone(),
                self.breaker.clone(),
            )),
            ConsumerRole::Analytics => RoleHandler::Analytics(AnalyticsHandler::new(
                self.analytics.clone(),
                self.reservations.clone(),
            )),
        }
    }

    pub fn consumer(&self, role: ConsumerRole) -> Result<EventConsumer<RoleHandler>, PipelineError> {
        EventConsumer::for_role(
            &self.router,
            role.as_ref(),
            self.ledger.clone(),
            Arc::new(self.handler(role)),
            self.consumer_config.clone(),
        )
    }

    /// Run the given roles until `shutdown` turns true.
    pub async fn run(
        &self,
        roles: &[ConsumerRole],
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let mut consumers = JoinSet::new();
        for role in roles {
            let consumer = self.consumer(*role)?;
            let shutdown = shutdown.clone();
            let role = *role;
            consumers.spawn(async move { (role, consumer.run(shutdown).await) });
        }
        info!(roles = ?roles, "Order pipeline running");

        let mut first_error = None;
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((role, Err(e))) => {
                    error!(%role, error = %e, "Consumer stopped with error");
                    first_error.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Consumer task failed"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
