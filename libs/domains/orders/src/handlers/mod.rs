//! Business handlers run by the consumer roles.

mod analytics;
mod inventory;
mod notification;

pub use analytics::AnalyticsHandler;
pub use inventory::{InventoryHandler, InventoryMode};
pub use notification::{NotificationHandler, message_for};
