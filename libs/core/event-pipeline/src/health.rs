//! Health check and admin handlers for event workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue and breaker monitoring (`/queues/{queue}`, `/breakers`)
//! - Prometheus metrics (`/metrics`)
//! - DLQ admin endpoints (`/admin/dlq/{role}`)

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::dlq::DeadLetterAdmin;
use crate::error::{BrokerError, PipelineError};
use crate::metrics;
use crate::resilience::{BreakerSnapshot, CircuitBreaker};
use crate::router::TopicRouter;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Router holding the broker and the declared topology.
    pub router: TopicRouter,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Breakers reported on `/breakers`.
    pub breakers: Vec<Arc<CircuitBreaker>>,
}

impl HealthState {
    /// Create a new health state.
    pub fn new(
        router: TopicRouter,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            router,
            app_name: app_name.into(),
            app_version: app_version.into(),
            breakers: Vec::new(),
        }
    }

    /// Report a circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.push(breaker);
        self
    }

    fn dlq_admin(&self, role: &str) -> Result<DeadLetterAdmin, ApiError> {
        DeadLetterAdmin::for_role(&self.router, role).map_err(error_response)
    }
}

fn error_response(err: PipelineError) -> ApiError {
    let status = match &err {
        PipelineError::UnknownRole(_) => StatusCode::NOT_FOUND,
        PipelineError::Broker(BrokerError::QueueNotFound(_)) => StatusCode::NOT_FOUND,
        PipelineError::Broker(BrokerError::Closed | BrokerError::Transport(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready while the broker connection is usable.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.router.broker().is_connected().await {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": "ok" }
            })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": "disconnected" }
            })),
        ))
    }
}

/// Queue depth for monitoring.
///
/// `GET /queues/{queue}`
pub async fn queue_info_handler(
    State(state): State<HealthState>,
    Path(queue): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let depth = state
        .router
        .broker()
        .queue_depth(&queue)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(json!({ "queue": queue, "depth": depth })))
}

/// Circuit breaker states.
///
/// `GET /breakers`
pub async fn breakers_handler(State(state): State<HealthState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.iter().map(|b| b.snapshot()).collect())
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

// ============================================================================
// DLQ Admin Handlers
// ============================================================================

/// Query parameters for the DLQ peek endpoint.
#[derive(Debug, Deserialize)]
pub struct DlqPeekParams {
    /// Maximum number of messages to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Query parameters for the DLQ replay endpoint.
#[derive(Debug, Deserialize)]
pub struct DlqReplayParams {
    /// Number of messages to replay (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub count: usize,
}

fn default_limit() -> usize {
    10
}

/// Peek at a role's dead letters.
///
/// `GET /admin/dlq/{role}?limit=10`
pub async fn dlq_peek_handler(
    State(state): State<HealthState>,
    Path(role): Path<String>,
    Query(params): Query<DlqPeekParams>,
) -> Result<Json<Value>, ApiError> {
    let admin = state.dlq_admin(&role)?;
    let limit = params.limit.min(100);

    let stats = admin.stats().await.map_err(error_response)?;
    let messages = admin.peek(limit).await.map_err(error_response)?;
    Ok(Json(json!({
        "role": stats.role,
        "queue": stats.queue,
        "depth": stats.depth,
        "limit": limit,
        "messages": messages,
    })))
}

/// Replay the oldest dead letters of a role.
///
/// `POST /admin/dlq/{role}/replay?count=10`
pub async fn dlq_replay_handler(
    State(state): State<HealthState>,
    Path(role): Path<String>,
    Query(params): Query<DlqReplayParams>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = state.dlq_admin(&role)?;
    let report = admin
        .replay(params.count.min(100))
        .await
        .map_err(error_response)?;
    Ok(Json(report))
}

/// Purge a role's DLQ.
///
/// WARNING: This permanently deletes the messages.
///
/// `DELETE /admin/dlq/{role}`
pub async fn dlq_purge_handler(
    State(state): State<HealthState>,
    Path(role): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = state.dlq_admin(&role)?;
    let purged = admin.purge().await.map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "role": role,
        "purged_count": purged,
    })))
}

/// Create a standard health router.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queues/{queue}", get(queue_info_handler))
        .route("/breakers", get(breakers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Create a router with DLQ admin endpoints.
///
/// - `GET /admin/dlq/{role}` - Peek at dead letters
/// - `POST /admin/dlq/{role}/replay` - Replay a batch
/// - `DELETE /admin/dlq/{role}` - Purge
pub fn admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route(
            "/admin/dlq/{role}",
            get(dlq_peek_handler).delete(dlq_purge_handler),
        )
        .route("/admin/dlq/{role}/replay", post(dlq_replay_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::envelope::{Event, EventType, RETRIES_HEADER};
    use crate::resilience::CircuitBreakerConfig;
    use crate::router::{QueueRoute, Topology};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn state() -> (Arc<InMemoryBroker>, HealthState) {
        let broker = Arc::new(InMemoryBroker::new());
        let router = TopicRouter::new(
            broker.clone(),
            Topology::default().with_route(QueueRoute::new("inventory", ["order.created"])),
        );
        router.declare().await.unwrap();
        let breaker = Arc::new(CircuitBreaker::new("slack", CircuitBreakerConfig::default()));
        let state = HealthState::new(router, "order-worker", "0.1.0").with_breaker(breaker);
        (broker, state)
    }

    fn app(state: HealthState) -> axum::Router {
        health_router(state.clone()).merge(admin_router(state))
    }

    async fn send(app: axum::Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn dead_letter(broker: &InMemoryBroker) {
        let event = Event::new(EventType::OrderCreated, Uuid::new_v4(), &json!({})).unwrap();
        let message = event.to_message().unwrap().with_header(RETRIES_HEADER, 3);
        broker.publish("integrahub.dlx", "inventory", message).await.unwrap();
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            name: "test-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"test-worker\""));
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (broker, state) = state().await;

        let (status, body) = send(app(state.clone()), Method::GET, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "order-worker");

        let (status, _) = send(app(state.clone()), Method::GET, "/ready").await;
        assert_eq!(status, StatusCode::OK);

        broker.set_online(false);
        let (status, body) = send(app(state), Method::GET, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_queue_info() {
        let (broker, state) = state().await;
        dead_letter(&broker).await;

        let (status, body) = send(app(state.clone()), Method::GET, "/queues/q_inventory.dlq").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["depth"], 1);

        let (status, _) = send(app(state), Method::GET, "/queues/q_missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_breakers() {
        let (_broker, state) = state().await;
        let (status, body) = send(app(state), Method::GET, "/breakers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "slack");
        assert_eq!(body[0]["state"], "closed");
    }

    #[tokio::test]
    async fn test_dlq_admin_flow() {
        let (broker, state) = state().await;
        dead_letter(&broker).await;
        dead_letter(&broker).await;

        let (status, body) = send(app(state.clone()), Method::GET, "/admin/dlq/inventory?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["depth"], 2);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);

        let (status, body) = send(
            app(state.clone()),
            Method::POST,
            "/admin/dlq/inventory/replay?count=1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["replayed"], 1);
        assert_eq!(broker.queue_depth("q_inventory").await.unwrap(), 1);

        let (status, body) = send(app(state), Method::DELETE, "/admin/dlq/inventory").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["purged_count"], 1);
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let (_broker, state) = state().await;
        let (status, body) = send(app(state), Method::GET, "/admin/dlq/billing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("billing"));
    }
}
