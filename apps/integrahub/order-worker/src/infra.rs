//! Backing services: broker, ledger, stores and notifier, chosen from configuration.

use crate::config::Config;
use domain_orders::{
    AnalyticsStore, InMemoryOrderStore, LogNotifier, Notifier, PgOrderStore, ReservationStore,
    SlackWebhookNotifier,
};
use event_pipeline::ledger::{PostgresLedger, RedisLedger};
use event_pipeline::{AmqpBroker, Broker, IdempotencyLedger, InMemoryBroker, InMemoryLedger};
use eyre::{Result, WrapErr};
use redis::aio::ConnectionManager;
use sea_orm::{Database, DatabaseConnection};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 5;

/// Retry `connect` with doubling pauses, starting at 500ms.
async fn connect_with_retry<T, E, F, Fut>(what: &str, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut pause = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(service = what, attempt, error = %e, "Connection failed, retrying");
                tokio::time::sleep(pause).await;
                pause *= 2;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("Failed to connect to {what} after {CONNECT_ATTEMPTS} attempts")
                });
            }
        }
    }
}

async fn connect_redis(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).wrap_err("Invalid REDIS_URL")?;
    connect_with_retry("Redis", || ConnectionManager::new(client.clone())).await
}

async fn connect_postgres(url: &str) -> Result<DatabaseConnection> {
    connect_with_retry("PostgreSQL", || Database::connect(url)).await
}

/// The message transport the roles coordinate through.
pub enum Transport {
    /// RabbitMQ; retries and dead letters outlive the process
    Amqp(Arc<AmqpBroker>),
    /// Single-process mode; every queue is lost on exit
    InProcess(Arc<InMemoryBroker>),
}

impl Transport {
    /// RabbitMQ when `BROKER_URL` is set, the in-process broker otherwise.
    pub async fn connect(config: &Config) -> Result<Self> {
        match &config.broker.url {
            Some(url) => {
                info!("Connecting to AMQP broker...");
                let broker = connect_with_retry("AMQP broker", || AmqpBroker::connect(url)).await?;
                Ok(Transport::Amqp(Arc::new(broker)))
            }
            None => {
                warn!("BROKER_URL not set; running every role on the in-process broker");
                Ok(Transport::InProcess(Arc::new(InMemoryBroker::new())))
            }
        }
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        match self {
            Transport::Amqp(broker) => broker.clone() as Arc<dyn Broker>,
            Transport::InProcess(broker) => broker.clone() as Arc<dyn Broker>,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Amqp(_) => "amqp",
            Transport::InProcess(_) => "in-process",
        }
    }

    /// Release the broker connection.
    pub async fn close(&self) {
        if let Transport::Amqp(broker) = self {
            if let Err(e) = broker.close().await {
                warn!(error = %e, "Failed to close the AMQP connection cleanly");
            }
        }
    }
}

/// Everything the pipeline persists or calls out to.
pub struct Backends {
    pub ledger: Arc<dyn IdempotencyLedger>,
    pub reservations: Arc<dyn ReservationStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Backends {
    /// Redis backs the ledger when configured, PostgreSQL backs the stores (and the
    /// ledger without Redis); anything unconfigured stays in memory.
    pub async fn connect(config: &Config) -> Result<Self> {
        let db = match &config.postgres.url {
            Some(url) => {
                info!("Connecting to PostgreSQL...");
                let db = connect_postgres(url).await?;
                info!("Connected to PostgreSQL successfully");
                Some(db)
            }
            None => None,
        };

        let ledger: Arc<dyn IdempotencyLedger> = match (&config.redis.url, &db) {
            (Some(url), _) => {
                info!("Connecting to Redis...");
                let conn = connect_redis(url).await?;
                info!("Connected to Redis successfully");
                Arc::new(RedisLedger::new(conn))
            }
            (None, Some(db)) => {
                let ledger = PostgresLedger::new(db.clone());
                ledger
                    .ensure_schema()
                    .await
                    .wrap_err("Failed to create the ledger table")?;
                Arc::new(ledger)
            }
            (None, None) => {
                warn!("No REDIS_URL or DATABASE_URL; the idempotency ledger is in memory");
                Arc::new(InMemoryLedger::new())
            }
        };

        let (reservations, analytics): (Arc<dyn ReservationStore>, Arc<dyn AnalyticsStore>) =
            match db {
                Some(db) => {
                    let store = PgOrderStore::new(db);
                    store
                        .ensure_schema()
                        .await
                        .wrap_err("Failed to create the order tables")?;
                    (Arc::new(store.clone()), Arc::new(store))
                }
                None => {
                    let store = InMemoryOrderStore::new();
                    (Arc::new(store.clone()), Arc::new(store))
                }
            };

        let notifier = notifier(config)?;

        Ok(Self {
            ledger,
            reservations,
            analytics,
            notifier,
        })
    }
}

/// Slack when a webhook is configured, otherwise log-only.
pub fn notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.notifier.slack_webhook_url {
        Some(url) => {
            let slack =
                SlackWebhookNotifier::new(url).wrap_err("Failed to build the Slack client")?;
            Ok(Arc::new(slack))
        }
        None => {
            info!("SLACK_WEBHOOK_URL not set; notifications are logged only");
            Ok(Arc::new(LogNotifier))
        }
    }
}
