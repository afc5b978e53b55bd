//! Prometheus metrics for event consumers
//!
//! Provides observability into dispatch outcomes, retries and breaker state.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another recorder is
/// already installed the handle renders an empty registry.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics initialized");
            handle
        }
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder");
            PrometheusBuilder::new().build_recorder().handle()
        }
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a circuit breaker state change
pub fn record_circuit_transition(breaker: &str, state: &str) {
    counter!(
        "pipeline_circuit_transitions_total",
        "breaker" => breaker.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Per-consumer metrics helper
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Consumer role for labeling
    role: String,
    /// Main queue for labeling
    queue: String,
}

impl PipelineMetrics {
    /// Create new PipelineMetrics
    pub fn new(role: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            queue: queue.into(),
        }
    }

    /// Record a delivery being received
    pub fn received(&self) {
        counter!(
            "pipeline_messages_received_total",
            "role" => self.role.clone(),
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record the final outcome of one dispatch
    pub fn processed(&self, outcome: &'static str, duration: Duration) {
        counter!(
            "pipeline_messages_processed_total",
            "role" => self.role.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "pipeline_handler_duration_seconds",
            "role" => self.role.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a redelivery skipped by the ledger
    pub fn duplicate(&self) {
        counter!(
            "pipeline_duplicates_total",
            "role" => self.role.clone()
        )
        .increment(1);
    }

    /// Record a handler failure
    pub fn handler_failed(&self, kind: &'static str) {
        counter!(
            "pipeline_handler_errors_total",
            "role" => self.role.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a delivery sent to the delay queue
    pub fn retried(&self, attempt: u32) {
        counter!(
            "pipeline_retries_total",
            "role" => self.role.clone(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a delivery routed to the DLQ
    pub fn dead_lettered(&self) {
        counter!(
            "pipeline_dead_letters_total",
            "role" => self.role.clone()
        )
        .increment(1);
    }

    /// Update queue depth gauge
    pub fn queue_depth(&self, queue: &str, depth: usize) {
        gauge!(
            "pipeline_queue_depth",
            "queue" => queue.to_string()
        )
        .set(depth as f64);
    }

    /// Consumer role
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Main queue
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PipelineMetrics::new("inventory", "q_inventory");
        assert_eq!(metrics.role(), "inventory");
        assert_eq!(metrics.queue(), "q_inventory");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(prometheus_handle().is_some());
    }
}
