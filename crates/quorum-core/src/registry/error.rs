//! Error types for the agent registry.

use thiserror::Error;

use crate::storage::error::StorageError;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No agent with the given id has ever sent a heartbeat.
    #[error("agent not found: {0}")]
    NotFound(String),

    /// The circuit protecting this operation is open.
    #[error("circuit open for {operation}")]
    CircuitOpen {
        /// Name of the protected operation.
        operation: String,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Storage(StorageError::Connection(err))
    }
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
