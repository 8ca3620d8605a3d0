//! Error types for the message broker.

use thiserror::Error;

use crate::storage::error::StorageError;

/// Errors that can occur in message broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The message failed validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The sender's token bucket is exhausted.
    #[error("rate limited: agent {agent_id}")]
    RateLimited {
        /// Agent whose bucket ran dry.
        agent_id: String,
    },

    /// The circuit protecting this operation is open.
    #[error("circuit open for {operation}")]
    CircuitOpen {
        /// Name of the protected operation.
        operation: String,
    },

    /// No message with the given id exists.
    #[error("message not found: {0}")]
    NotFound(String),

    /// Broadcast submitted to a channel nobody has ever subscribed to.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// An `ask` ran out of time waiting for the response.
    #[error("timed out after {waited_ms}ms waiting for response")]
    Timeout {
        /// How long the caller polled.
        waited_ms: u64,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Storage(StorageError::Connection(err))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Storage(StorageError::Serialization(err))
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
