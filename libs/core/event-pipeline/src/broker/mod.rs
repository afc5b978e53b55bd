//! Broker transport abstraction
//!
//! The pipeline relies on the AMQP 0-9-1 model:
//! - **Exchanges** (`topic` or `direct`, plus the nameless default exchange that routes
//!   by queue name) route published messages to bound queues
//! - **Queues** may carry a message TTL and a dead-letter exchange; expired or rejected
//!   messages are re-published there
//! - **Consumers** receive deliveries up to a prefetch limit and settle each one with
//!   `ack` or `nack`; unsettled deliveries are redelivered when the consumer goes away
//!
//! `InMemoryBroker` implements these semantics in-process; `AmqpBroker` (feature
//! `amqp`) speaks them to RabbitMQ.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::InMemoryBroker;

use crate::envelope::{CONTENT_TYPE_JSON, RETRIES_HEADER};
use crate::error::BrokerError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::mpsc;

/// Per-message header table.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// A message as published to and stored by the broker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    /// Opaque body
    pub body: Vec<u8>,
    /// Transport headers
    pub headers: Headers,
    /// MIME content type
    pub content_type: Option<String>,
    /// Per-message TTL; the lower of this and the queue TTL applies
    pub expiration: Option<Duration>,
}

impl Message {
    /// Create a JSON message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: Headers::new(),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            expiration: None,
        }
    }

    /// Set a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Remove a header.
    pub fn without_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    /// Set (or clear) the per-message expiration.
    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Attempt count carried in `x-retries` (0 when absent or unreadable).
    ///
    /// Some clients send header integers as strings, both forms are accepted.
    pub fn retries(&self) -> u32 {
        match self.headers.get(RETRIES_HEADER) {
            Some(serde_json::Value::Number(n)) => {
                n.as_u64().map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(0)
            }
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Read a string header.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.as_str())
    }
}

/// Identifies one delivery for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub queue: String,
    pub id: u64,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag to settle the delivery with
    pub tag: DeliveryTag,
    /// Exchange the message was last published to
    pub exchange: String,
    /// Routing key the message was last published with
    pub routing_key: String,
    /// True when the broker delivered this message before without it being settled
    pub redelivered: bool,
    /// The message itself
    pub message: Message,
}

/// Exchange types used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Exact routing-key match
    Direct,
    /// Dotted pattern match with `*` (one word) and `#` (zero or more words)
    Topic,
}

/// Queue declaration arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueArgs {
    /// Survives broker restarts
    pub durable: bool,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key` (the message's own key when absent)
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArgs {
    /// A durable queue without TTL or dead-lettering.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Set the queue message TTL.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Set the dead-letter target.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }
}

/// Stream of deliveries for one consumer.
///
/// Dropping the subscription cancels the consumer; every delivery it has not settled
/// is returned to the queue and redelivered.
pub struct Subscription {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    /// Create a subscription fed by a broker-side channel.
    pub fn new(queue: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            receiver,
        }
    }

    /// Queue this subscription consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery. `None` once the broker closed the consumer.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Broker operations used by the router, dispatcher and admin tooling.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue. Redeclaring with the same arguments is a no-op.
    async fn declare_queue(&self, name: &str, args: QueueArgs) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange. Existing bindings are not duplicated.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish a message. Unroutable messages are dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError>;

    /// Start consuming with at most `prefetch` unsettled deliveries.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError>;

    /// Fetch a single message without a consumer (basic.get).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery; requeue it or dead-letter it through the queue's DLX.
    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Number of messages ready for delivery.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Drop every ready message, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Copies of up to `limit` ready messages from the head of `queue`, left in place.
    ///
    /// The default fetches and requeues them in reverse order, which keeps the order
    /// but makes the broker flag them as redelivered. Brokers that can look without
    /// taking override it.
    async fn browse(&self, queue: &str, limit: usize) -> Result<Vec<Message>, BrokerError> {
        let mut taken: Vec<Delivery> = Vec::with_capacity(limit);
        let mut failure = None;

        while taken.len() < limit {
            match self.get(queue).await {
                Ok(Some(delivery)) => taken.push(delivery),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        for delivery in taken.iter().rev() {
            if let Err(e) = self.nack(&delivery.tag, true).await {
                tracing::warn!(queue, error = %e, "Failed to return browsed message");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(taken.into_iter().map(|d| d.message).collect()),
        }
    }

    /// Whether the transport is currently usable.
    async fn is_connected(&self) -> bool {
        true
    }
}

/// Match a routing key against a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches zero or
/// more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
