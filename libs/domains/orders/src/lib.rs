//! Orders Domain
//!
//! The business side of the order pipeline: payloads, the gateway that accepts
//! orders, the stores, the chat notifier and the three consumer roles.
//!
//! # Flow
//!
//! ```text
//! OrderGateway ──OrderCreated──> inventory ──InventoryReserved, OrderConfirmed──> notifications
//!                                    │                               └──────────> analytics
//!                                    └── dead-lettered ──OrderFailed──> notifications
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_orders::{ConsumerRole, OrderPipeline, order_topology};
//!
//! let router = TopicRouter::new(broker, order_topology("integrahub.events", "integrahub.dlx"));
//! router.declare().await?;
//!
//! let pipeline = OrderPipeline::new(router, ledger);
//! let accepted = pipeline.gateway().submit(request).await?;
//! pipeline.run(&ConsumerRole::all(), shutdown_rx).await?;
//! ```

pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod notifier;
pub mod pipeline;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod repository;
pub mod state;
pub mod stock;

// Re-export commonly used types
pub use error::{GatewayError, NotifierError, OrderError, OrderResult};
pub use gateway::OrderGateway;
pub use handlers::{AnalyticsHandler, InventoryHandler, InventoryMode, NotificationHandler};
pub use models::{
    DailyAggregate, InventoryReserved, OrderAccepted, OrderConfirmed, OrderCreated, OrderFailed,
    OrderItem, OrderRequest, Reservation,
};
pub use notifier::{LogNotifier, Notifier, SlackWebhookNotifier};
pub use pipeline::{ConsumerRole, OrderPipeline, RoleHandler, order_topology};
#[cfg(feature = "postgres")]
pub use postgres::PgOrderStore;
pub use repository::{AnalyticsStore, InMemoryOrderStore, ReservationStore};
pub use state::{OrderState, OrderTimeline};
pub use stock::{FixedStock, OUT_OF_STOCK_SENTINEL, SentinelStockCheck, StockCheck};
