use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigtradeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited by {venue}: {detail}")]
    RateLimited { venue: String, detail: String },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid symbol or precision: {0}")]
    InvalidSymbolOrPrecision(String),

    #[error("Transient venue error: {0}")]
    Transient(String),

    #[error("Order rejected by venue: {0}")]
    OrderRejected(String),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Reconciliation conflict for position {position_id}: {detail}")]
    ReconciliationConflict { position_id: String, detail: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Unsupported operation on {venue}: {operation}")]
    Unsupported { venue: String, operation: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Order execution failures that survive retry exhaustion. Clone-able so
/// they can be attached to notification events and stored on the position.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Cancel failed for order {order_id}: {reason}")]
    CancelFailed { order_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SigtradeError>;

impl SigtradeError {
    /// Whether the executor may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SigtradeError::RateLimited { .. } | SigtradeError::Transient(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SigtradeError::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        SigtradeError::Transient(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SigtradeError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SigtradeError::RateLimited {
            venue: "binance".into(),
            detail: "429".into()
        }
        .is_retryable());
        assert!(SigtradeError::transient("connection reset").is_retryable());
        assert!(!SigtradeError::InsufficientFunds("margin".into()).is_retryable());
        assert!(!SigtradeError::OrderRejected("reduce-only".into()).is_retryable());
        assert!(!SigtradeError::validation("bad plan").is_retryable());
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::MaxRetriesExceeded {
            attempts: 3,
            last_error: "timeout".into(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }
}
