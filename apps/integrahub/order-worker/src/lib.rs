//! Order Worker Service
//!
//! Runs any subset of the order pipeline roles against one broker.
//!
//! ## Architecture
//!
//! ```text
//! seed file ──> OrderGateway ──> integrahub.events (topic)
//!                                   ├─ order.created ──> q_inventory ──> InventoryHandler
//!                                   ├─ order.#       ──> q_notifications ──> NotificationHandler ──> Slack
//!                                   └─ order.confirmed ──> q_analytics ──> AnalyticsHandler
//! failures ──> q_<role>.delay (TTL) ──> retry.<role> ──> q_<role>
//! exhausted ──> integrahub.dlx ──> q_<role>.dlq
//! ```
//!
//! With `BROKER_URL` set the roles talk to RabbitMQ, so each role can run in its own
//! process (`--roles inventory`, `--roles notifications`, ...) and pending retries
//! survive restarts. Without it everything runs on the in-process broker. The
//! ledger and stores use Redis and PostgreSQL when configured.

mod cli;
mod config;
mod infra;
mod seed;

pub use cli::Cli;
pub use config::Config;

use axum::Router;
use core_config::FromEnv;
use domain_orders::OrderPipeline;
use event_pipeline::{HealthState, TopicRouter, admin_router, health_router, init_metrics};
use eyre::{Result, WrapErr};
use infra::{Backends, Transport};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Serve health, metrics and DLQ admin endpoints until shutdown.
async fn start_health_server(
    state: HealthState,
    address: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app: Router = health_router(state.clone()).merge(admin_router(state));

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", address))?;
    info!(%address, "Health and admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Health server failed")?;
    Ok(())
}

/// Run the order worker
///
/// 1. Loads configuration and sets up tracing and metrics
/// 2. Connects the broker, ledger, stores and notifier
/// 3. Declares the topology and starts the health server
/// 4. Seeds orders when asked, then consumes until SIGINT/SIGTERM
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().wrap_err("Invalid configuration")?;
    if let Some(port) = cli.health_port {
        config.worker.health_port = port;
    }

    core_config::tracing::init_tracing(&config.environment, env!("CARGO_PKG_NAME"));
    init_metrics();

    let roles = cli.roles();
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        roles = ?roles,
        "Starting order worker"
    );

    let transport = Transport::connect(&config).await?;
    let backends = Backends::connect(&config).await?;

    info!(transport = transport.name(), "Declaring topology");
    let router = TopicRouter::new(transport.broker(), config.topology());
    router
        .declare()
        .await
        .wrap_err("Failed to declare the broker topology")?;

    let pipeline = OrderPipeline::new(router.clone(), backends.ledger)
        .with_reservation_store(backends.reservations)
        .with_analytics_store(backends.analytics)
        .with_notifier(backends.notifier)
        .with_breaker_config(config.breaker_config())
        .with_consumer_config(config.consumer_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(router, env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .with_breaker(pipeline.breaker());
    let address = config.worker.address();
    let health_shutdown = shutdown_rx.clone();
    let health = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, address, health_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    if let Some(path) = &cli.seed {
        let orders = seed::load_orders(path).await?;
        let accepted = seed::submit_orders(&pipeline.gateway(), orders).await;
        info!(count = accepted.len(), "Seed orders submitted");
    }

    pipeline
        .run(&roles, shutdown_rx)
        .await
        .wrap_err("Order pipeline stopped with an error")?;

    let _ = health.await;
    transport.close().await;
    info!("Order worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
