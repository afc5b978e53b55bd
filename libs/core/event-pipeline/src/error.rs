//! Pipeline error types and handler error categorization
//!
//! Handler errors are categorized to drive the dispatcher's rejection policy:
//! - **Transient**: infrastructure hiccups (broker, storage, downstream webhook)
//! - **Permanent**: business rejections and malformed payloads
//!
//! Under the default policy both categories consume the same retry budget before
//! being dead-lettered.

use thiserror::Error;

/// Category of a handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry through the delay queue
    Transient,
    /// Retrying will not change the outcome
    Permanent,
}

/// Errors returned by event handlers.
///
/// These never escape the consumer: the dispatcher converts every one of them into a
/// retry-or-dead-letter decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Network, broker or storage hiccup
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The business logic refused the event (e.g. out of stock)
    #[error("Business rejection: {0}")]
    Rejected(String),

    /// A protected downstream call was not attempted
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The idempotency ledger or a persistence store is unreachable
    #[error("Storage unavailable: {0}")]
    Storage(String),

    /// The delivery body is not a valid event
    #[error("Malformed event: {0}")]
    Malformed(String),
}

impl HandlerError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    /// Create a business rejection
    pub fn rejected(message: impl Into<String>) -> Self {
        HandlerError::Rejected(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::Transient(_) => ErrorCategory::Transient,
            HandlerError::CircuitOpen(_) => ErrorCategory::Transient,
            HandlerError::Storage(_) => ErrorCategory::Transient,
            HandlerError::Rejected(_) => ErrorCategory::Permanent,
            HandlerError::Malformed(_) => ErrorCategory::Permanent,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Transient(_) => "transient",
            HandlerError::Rejected(_) => "rejected",
            HandlerError::CircuitOpen(_) => "circuit_open",
            HandlerError::Storage(_) => "storage",
            HandlerError::Malformed(_) => "malformed",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Malformed(err.to_string())
    }
}

impl From<LedgerError> for HandlerError {
    fn from(err: LedgerError) -> Self {
        HandlerError::Storage(err.to_string())
    }
}

impl From<BrokerError> for HandlerError {
    fn from(err: BrokerError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

/// Broker transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Exchange has not been declared
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Queue has not been declared
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Redeclaration with incompatible arguments
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack/nack for a delivery the broker does not know (already settled or requeued)
    #[error("Unknown delivery tag {tag} on queue {queue}")]
    UnknownDeliveryTag { queue: String, tag: u64 },

    /// Connection or channel closed
    #[error("Broker connection closed")]
    Closed,

    /// Any other transport failure reported by a network broker
    #[error("Broker transport error: {0}")]
    Transport(String),
}

/// Idempotency ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Backing store unreachable or command failed
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LedgerError {
    fn from(err: redis::RedisError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sea_orm::DbErr> for LedgerError {
    fn from(err: sea_orm::DbErr) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Framework-level errors (setup, consumption loop, admin operations)
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Broker error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No route declared for a consumer role
    #[error("Unknown consumer role: {0}")]
    UnknownRole(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}
