use event_pipeline::{HandlerError, PipelineError};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the order stores and handlers.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Insufficient stock for product '{0}'")]
    OutOfStock(String),

    #[error("Reservation not found for order {0}")]
    ReservationNotFound(Uuid),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Notifier error: {0}")]
    Notifier(#[from] NotifierError),
}

pub type OrderResult<T> = Result<T, OrderError>;

/// Handler-facing classification: stock shortages are business rejections,
/// everything else is worth another attempt.
impl From<OrderError> for HandlerError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::OutOfStock(_) => HandlerError::Rejected(err.to_string()),
            OrderError::InvalidPayload(msg) => HandlerError::Malformed(msg),
            OrderError::Storage(msg) => HandlerError::Storage(msg),
            OrderError::ReservationNotFound(_) | OrderError::Publish(_) | OrderError::Notifier(_) => {
                HandlerError::Transient(err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(err: serde_json::Error) -> Self {
        OrderError::InvalidPayload(err.to_string())
    }
}

impl From<PipelineError> for OrderError {
    fn from(err: PipelineError) -> Self {
        OrderError::Publish(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sea_orm::DbErr> for OrderError {
    fn from(err: sea_orm::DbErr) -> Self {
        OrderError::Storage(format!("Database error: {}", err))
    }
}

/// Errors from the downstream chat webhook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifierError {
    /// The webhook answered with a non-success status
    #[error("Webhook returned status {0}")]
    Status(u16),

    #[error("Webhook request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NotifierError {
    fn from(err: reqwest::Error) -> Self {
        NotifierError::Transport(err.to_string())
    }
}

/// Errors returned to the caller of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid order: {0}")]
    Validation(String),

    #[error("Failed to publish order event: {0}")]
    Publish(String),
}
