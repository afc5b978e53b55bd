//! Stock availability checks used by the inventory handler.

use crate::error::{OrderError, OrderResult};
use crate::models::OrderItem;
use async_trait::async_trait;
use std::collections::HashMap;

/// Product id that is never in stock
pub const OUT_OF_STOCK_SENTINEL: &str = "FAIL-INV";

/// Decides whether an order's lines can be reserved.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StockCheck: Send + Sync {
    /// `Err(OrderError::OutOfStock)` names the first line that cannot be served.
    async fn check(&self, items: &[OrderItem]) -> OrderResult<()>;
}

/// Every product is available except the sentinel.
#[derive(Debug, Clone)]
pub struct SentinelStockCheck {
    sentinel: String,
}

impl SentinelStockCheck {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }
}

impl Default for SentinelStockCheck {
    fn default() -> Self {
        Self::new(OUT_OF_STOCK_SENTINEL)
    }
}

#[async_trait]
impl StockCheck for SentinelStockCheck {
    async fn check(&self, items: &[OrderItem]) -> OrderResult<()> {
        match items.iter().find(|item| item.product_id == self.sentinel) {
            Some(item) => Err(OrderError::OutOfStock(item.product_id.clone())),
            None => Ok(()),
        }
    }
}

/// Fixed on-hand quantities; unknown products are unavailable.
#[derive(Debug, Clone, Default)]
pub struct FixedStock {
    on_hand: HashMap<String, u32>,
}

impl FixedStock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, product_id: impl Into<String>, quantity: u32) -> Self {
        self.on_hand.insert(product_id.into(), quantity);
        self
    }
}

#[async_trait]
impl StockCheck for FixedStock {
    async fn check(&self, items: &[OrderItem]) -> OrderResult<()> {
        // Lines may repeat a product
        let mut wanted: HashMap<&str, u32> = HashMap::new();
        for item in items {
            *wanted.entry(item.product_id.as_str()).or_default() += item.quantity;
        }

        for item in items {
            let available = self.on_hand.get(&item.product_id).copied().unwrap_or(0);
            let requested = wanted.get(item.product_id.as_str()).copied().unwrap_or(0);
            if requested > available {
                return Err(OrderError::OutOfStock(item.product_id.clone()));
            }
        }
        Ok(())
    }
}
