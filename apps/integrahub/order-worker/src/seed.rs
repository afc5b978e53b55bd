//! Startup seeding: submit orders from a JSON file through the gateway.

use domain_orders::{OrderAccepted, OrderGateway, OrderRequest};
use eyre::{Result, WrapErr};
use std::path::Path;
use tracing::{info, warn};

pub fn parse_orders(json: &str) -> Result<Vec<OrderRequest>> {
    serde_json::from_str(json).wrap_err("Seed file must be a JSON array of orders")
}

pub async fn load_orders(path: &Path) -> Result<Vec<OrderRequest>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("Failed to read seed file {}", path.display()))?;
    parse_orders(&json)
}

/// Submit every order; rejected ones are logged and skipped.
pub async fn submit_orders(
    gateway: &OrderGateway,
    orders: Vec<OrderRequest>,
) -> Vec<OrderAccepted> {
    let mut accepted = Vec::with_capacity(orders.len());
    for (index, order) in orders.into_iter().enumerate() {
        match gateway.submit(order).await {
            Ok(ok) => {
                info!(index, order_id = %ok.order_id, correlation_id = %ok.correlation_id, "Seeded order");
                accepted.push(ok);
            }
            Err(e) => warn!(index, error = %e, "Seed order rejected"),
        }
    }
    accepted
}
