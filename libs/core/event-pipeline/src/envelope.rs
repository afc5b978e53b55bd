//! Event envelope
//!
//! The wire format shared by the gateway and every consumer:
//!
//! ```json
//! {"event_id": "...", "event_type": "OrderCreated", "correlation_id": "...", "data": {...}}
//! ```
//!
//! The attempt count is not part of the body; it travels in the `x-retries`
//! transport header so a retried delivery carries the exact same body.

use crate::broker::Message;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use uuid::Uuid;

/// Attempt counter header (integer, absent means 0)
pub const RETRIES_HEADER: &str = "x-retries";

/// Error description attached to dead-lettered copies
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// Queue a dead-lettered copy was consumed from
pub const ORIGIN_QUEUE_HEADER: &str = "x-origin-queue";

/// Content type of every event body
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Order lifecycle event types.
///
/// Unrecognised names decode as `Unknown` so that a newer producer never makes an
/// older consumer fail to parse the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumIter)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    OrderCreated,
    InventoryReserved,
    OrderConfirmed,
    OrderFailed,
    Unknown,
}

impl EventType {
    /// Topic routing key for this event type.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::OrderCreated => "order.created",
            Self::InventoryReserved => "order.reserved",
            Self::OrderConfirmed => "order.confirmed",
            Self::OrderFailed => "order.failed",
            Self::Unknown => "order.unknown",
        }
    }

    /// All known (routable) event types.
    pub fn known() -> impl Iterator<Item = Self> {
        Self::iter().filter(|t| *t != Self::Unknown)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "OrderCreated" => EventType::OrderCreated,
            "InventoryReserved" => EventType::InventoryReserved,
            "OrderConfirmed" => EventType::OrderConfirmed,
            "OrderFailed" => EventType::OrderFailed,
            _ => EventType::Unknown,
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_ref().to_string()
    }
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier of this event instance
    pub event_id: Uuid,

    /// Lifecycle event type
    pub event_type: EventType,

    /// Groups every event belonging to one order
    pub correlation_id: Uuid,

    /// Payload whose schema depends on `event_type`
    #[serde(default)]
    pub data: serde_json::Value,

    /// When the producer created the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a new event with a fresh id.
    pub fn new<T: Serialize>(
        event_type: EventType,
        correlation_id: Uuid,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type,
            correlation_id,
            data: serde_json::to_value(data)?,
            occurred_at: Some(Utc::now()),
        })
    }

    /// Create a follow-up event caused by `self`.
    ///
    /// The id is derived from the cause's id and the new type, so re-running the handler
    /// that emits it produces the same event id.
    pub fn follow_up<T: Serialize>(
        &self,
        event_type: EventType,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v5(&self.event_id, event_type.as_ref().as_bytes()),
            event_type,
            correlation_id: self.correlation_id,
            data: serde_json::to_value(data)?,
            occurred_at: Some(Utc::now()),
        })
    }

    /// Decode the typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Topic routing key of this event.
    pub fn routing_key(&self) -> &'static str {
        self.event_type.routing_key()
    }

    /// Key under which the idempotency ledger records this event.
    ///
    /// One order emits several event types under the same correlation id, so the
    /// type is part of the key.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.event_type, self.correlation_id)
    }

    /// Calendar date the event belongs to (falls back to today).
    pub fn occurred_on(&self) -> NaiveDate {
        self.occurred_at.unwrap_or_else(Utc::now).date_naive()
    }

    /// Parse an envelope from a delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Serialize into a fresh transport message (`x-retries = 0`).
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        Ok(Message::json(body).with_header(RETRIES_HEADER, 0))
    }
}
