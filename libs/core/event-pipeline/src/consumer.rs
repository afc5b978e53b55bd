//! Consumer loop
//!
//! Subscribes to a role's main queue and runs one task per delivery. The broker's
//! prefetch limit bounds the number of in-flight tasks. On shutdown the loop stops
//! taking deliveries, waits up to the grace period for in-flight tasks, and then
//! cancels the subscription; whatever was not acknowledged by then is redelivered.

use crate::broker::Broker;
use crate::config::ConsumerConfig;
use crate::dispatcher::{DispatcherConfig, EventHandler, RetryableDispatcher};
use crate::error::PipelineError;
use crate::ledger::IdempotencyLedger;
use crate::router::TopicRouter;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Runs a [`RetryableDispatcher`] against a queue.
pub struct EventConsumer<H: ?Sized> {
    broker: Arc<dyn Broker>,
    dispatcher: Arc<RetryableDispatcher<H>>,
    config: ConsumerConfig,
}

impl<H> EventConsumer<H>
where
    H: EventHandler + ?Sized + 'static,
{
    pub fn new(
        broker: Arc<dyn Broker>,
        dispatcher: Arc<RetryableDispatcher<H>>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            config,
        }
    }

    /// Build a consumer for a role declared on `router`.
    pub fn for_role(
        router: &TopicRouter,
        role: &str,
        ledger: Arc<dyn IdempotencyLedger>,
        handler: Arc<H>,
        config: ConsumerConfig,
    ) -> Result<Self, PipelineError> {
        let route = router.route(role)?;
        if config.retry.max_delay > router.topology().max_delay() {
            return Err(PipelineError::Config(format!(
                "retry max delay {:?} exceeds the delay queue TTL {:?}",
                config.retry.max_delay,
                router.topology().max_delay()
            )));
        }

        let dispatcher_config = DispatcherConfig::for_route(router.topology(), route)
            .with_retry_policy(config.retry.clone());
        let dispatcher = Arc::new(RetryableDispatcher::new(
            router.broker(),
            ledger,
            handler,
            dispatcher_config,
        ));

        Ok(Self::new(router.broker(), dispatcher, config))
    }

    pub fn dispatcher(&self) -> &Arc<RetryableDispatcher<H>> {
        &self.dispatcher
    }

    pub fn role(&self) -> &str {
        &self.dispatcher.config().role
    }

    /// Consume until `shutdown` turns true (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let queue = self.dispatcher.config().queue.clone();
        let role = self.role().to_string();

        let mut subscription = self.broker.consume(&queue, self.config.prefetch).await?;
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            role = %role,
            queue = %queue,
            handler = self.dispatcher.handler().name(),
            prefetch = self.config.prefetch,
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(role = %role, "Received shutdown signal, stopping consumer");
                        break;
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(role = %role, error = %e, "Dispatch task failed");
                    }
                }

                delivery = subscription.next() => {
                    let Some(delivery) = delivery else {
                        warn!(role = %role, queue = %queue, "Subscription closed by broker");
                        break;
                    };

                    let dispatcher = self.dispatcher.clone();
                    in_flight.spawn(async move {
                        let outcome = dispatcher.dispatch(delivery).await;
                        debug!(outcome = outcome.label(), "Dispatch finished");
                    });
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(role = %role, pending, "Waiting for in-flight handlers");
        }

        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(role = %role, error = %e, "Dispatch task failed");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                role = %role,
                remaining = in_flight.len(),
                "Shutdown grace elapsed, abandoning in-flight handlers"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        // Unacknowledged deliveries go back to the queue
        drop(subscription);

        info!(role = %role, "Consumer stopped");
        Ok(())
    }
}
