//! Error types for orderflow

use thiserror::Error;

/// Result type alias for orderflow operations
pub type Result<T> = std::result::Result<T, OrderflowError>;

/// Main error type for orderflow
#[derive(Error, Debug)]
pub enum OrderflowError {
    /// Order source unreachable, timed out, or answered with a non-success status
    #[error("Order source unavailable: {0}")]
    SourceUnavailable(String),

    /// Queue already exists with settings that differ from the declaration
    #[error("Queue '{queue}' exists with incompatible settings: {reason}")]
    QueueConfigMismatch { queue: String, reason: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Broker transport failure; fatal to the current process invocation
    #[error("Broker connection lost: {0}")]
    BrokerConnectionLost(String),

    /// A delivered message body could not be decoded into an order batch
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Malformed order record {id}: {reason}")]
    MalformedRecord { id: i64, reason: String },

    /// Store open, schema, upsert or commit failure
    #[error("Store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrderflowError {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::BrokerConnectionLost(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreWriteFailed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn queue_mismatch(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::QueueConfigMismatch {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends a long-running consumer rather than a single message
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::BrokerConnectionLost(_) | Self::QueueConfigMismatch { .. } | Self::QueueNotFound(_)
        )
    }
}
