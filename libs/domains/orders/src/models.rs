use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{OrderError, OrderResult};

/// Status reported to the caller while the pipeline works on the order
pub const STATUS_PROCESSING: &str = "PROCESSING";

/// Status carried by `OrderConfirmed`
pub const STATUS_CONFIRMED: &str = "CONFIRMED";

/// Highest accepted unit price (one hundred million in major units)
pub const MAX_UNIT_PRICE_CENTS: i64 = 10_000_000_000;

/// One order line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct OrderItem {
    #[validate(length(min = 1, max = 64))]
    pub product_id: String,

    #[validate(range(min = 1, max = 10_000))]
    pub quantity: u32,

    /// Price per unit in cents, when the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0, max = MAX_UNIT_PRICE_CENTS))]
    pub unit_price_cents: Option<i64>,
}

impl OrderItem {
    pub fn new(product_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
            unit_price_cents: None,
        }
    }

    pub fn with_unit_price(mut self, cents: i64) -> Self {
        self.unit_price_cents = Some(cents);
        self
    }

    /// Line total; unpriced lines count as zero
    pub fn total_cents(&self) -> OrderResult<i64> {
        self.unit_price_cents
            .unwrap_or(0)
            .checked_mul(i64::from(self.quantity))
            .ok_or_else(|| {
                OrderError::InvalidPayload(format!(
                    "line total of '{}' overflows",
                    self.product_id
                ))
            })
    }
}

/// Order as submitted to the gateway
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderRequest {
    #[validate(length(min = 1, max = 128))]
    pub customer_id: String,

    #[validate(length(min = 1, max = 100), nested)]
    pub items: Vec<OrderItem>,
}

/// Gateway response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub order_id: Uuid,
    pub correlation_id: Uuid,
    pub status: String,
}

/// Payload of `OrderCreated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: Uuid,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
}

impl OrderCreated {
    pub fn amount_cents(&self) -> OrderResult<i64> {
        self.items.iter().try_fold(0i64, |sum, item| {
            sum.checked_add(item.total_cents()?).ok_or_else(|| {
                OrderError::InvalidPayload(format!("order {} total overflows", self.order_id))
            })
        })
    }
}

/// Payload of `InventoryReserved`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReserved {
    pub order_id: Uuid,
    pub customer_id: String,
    pub amount_cents: i64,
}

/// Payload of `OrderConfirmed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: Uuid,
    pub status: String,
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<i64>,
}

/// Payload of `OrderFailed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailed {
    pub order_id: Uuid,
    pub customer_id: String,
    pub reason: String,
}

/// Fields every order event payload shares
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderRef {
    pub order_id: Uuid,
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// Stock held for an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: Uuid,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub amount_cents: i64,
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    pub fn for_order(order: &OrderCreated) -> OrderResult<Self> {
        Ok(Self {
            order_id: order.order_id,
            customer_id: order.customer_id.clone(),
            items: order.items.clone(),
            amount_cents: order.amount_cents()?,
            reserved_at: Utc::now(),
        })
    }
}

/// Confirmed-order totals for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub total_orders: i64,
    pub total_revenue_cents: i64,
    pub last_updated: DateTime<Utc>,
}
