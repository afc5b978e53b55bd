//! Dead Letter Queue (DLQ) administration
//!
//! Dead letters are terminal for the pipeline; only an operator brings them back.
//! Replay republishes a message to the events exchange on the role's retry key,
//! so it reaches only the role it failed in, with a fresh retry budget.

use crate::broker::{Broker, Message};
use crate::envelope::{Event, LAST_ERROR_HEADER, ORIGIN_QUEUE_HEADER, RETRIES_HEADER};
use crate::error::PipelineError;
use crate::router::{QueueRoute, TopicRouter};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// DLQ statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub role: String,
    pub queue: String,
    pub depth: usize,
}

/// One dead-lettered message, decoded for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterEntry {
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub origin_queue: Option<String>,
    /// Body as JSON, or as a string when it is not valid JSON
    pub body: serde_json::Value,
}

impl From<&Message> for DeadLetterEntry {
    fn from(message: &Message) -> Self {
        let event = Event::from_slice(&message.body).ok();
        let body = serde_json::from_slice(&message.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.body).into_owned())
        });

        Self {
            event_id: event.as_ref().map(|e| e.event_id),
            event_type: event.as_ref().map(|e| e.event_type.to_string()),
            correlation_id: event.as_ref().map(|e| e.correlation_id),
            retries: message.retries(),
            last_error: message.header_str(LAST_ERROR_HEADER).map(str::to_string),
            origin_queue: message.header_str(ORIGIN_QUEUE_HEADER).map(str::to_string),
            body,
        }
    }
}

/// Result of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
}

/// Operator access to one role's DLQ.
#[derive(Clone)]
pub struct DeadLetterAdmin {
    broker: Arc<dyn Broker>,
    route: QueueRoute,
    events_exchange: String,
}

impl DeadLetterAdmin {
    pub fn new(broker: Arc<dyn Broker>, route: QueueRoute, events_exchange: impl Into<String>) -> Self {
        Self {
            broker,
            route,
            events_exchange: events_exchange.into(),
        }
    }

    /// Admin for a role declared on `router`.
    pub fn for_role(router: &TopicRouter, role: &str) -> Result<Self, PipelineError> {
        let route = router.route(role)?.clone();
        Ok(Self::new(
            router.broker(),
            route,
            router.topology().events_exchange(),
        ))
    }

    pub fn queue(&self) -> String {
        self.route.dead_letter_queue()
    }

    /// Get DLQ statistics
    pub async fn stats(&self) -> Result<DlqStats, PipelineError> {
        let queue = self.queue();
        let depth = self.broker.queue_depth(&queue).await?;
        Ok(DlqStats {
            role: self.route.role().to_string(),
            queue,
            depth,
        })
    }

    /// Look at up to `limit` messages from the head of the DLQ without removing them.
    ///
    /// On RabbitMQ a peeked message comes back flagged as redelivered. Replay publishes
    /// a new message, so the flag never reaches the role's queue.
    pub async fn peek(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, PipelineError> {
        let messages = self.broker.browse(&self.queue(), limit).await?;
        Ok(messages.iter().map(DeadLetterEntry::from).collect())
    }

    /// Republish up to `count` messages for another round of processing.
    pub async fn replay(&self, count: usize) -> Result<ReplayReport, PipelineError> {
        let queue = self.queue();
        let routing_key = self.route.retry_routing_key();
        let mut report = ReplayReport::default();

        while report.replayed < count {
            let Some(delivery) = self.broker.get(&queue).await? else {
                break;
            };

            let message = delivery
                .message
                .clone()
                .without_header(LAST_ERROR_HEADER)
                .without_header(ORIGIN_QUEUE_HEADER)
                .with_header(RETRIES_HEADER, 0)
                .with_expiration(None);

            if let Err(e) = self
                .broker
                .publish(&self.events_exchange, &routing_key, message)
                .await
            {
                if let Err(nack_err) = self.broker.nack(&delivery.tag, true).await {
                    warn!(queue = %queue, error = %nack_err, "Failed to return DLQ message");
                }
                return Err(e.into());
            }
            self.broker.ack(&delivery.tag).await?;
            report.replayed += 1;
        }

        report.remaining = self.broker.queue_depth(&queue).await?;
        info!(
            role = self.route.role(),
            replayed = report.replayed,
            remaining = report.remaining,
            "Replayed dead letters"
        );
        Ok(report)
    }

    /// Drop every message in the DLQ.
    pub async fn purge(&self) -> Result<usize, PipelineError> {
        let queue = self.queue();
        let purged = self.broker.purge(&queue).await?;
        warn!(role = self.route.role(), purged, "Purged dead letters");
        Ok(purged)
    }
}
