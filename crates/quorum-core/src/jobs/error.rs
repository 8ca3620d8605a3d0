//! Error types for the job board.

use thiserror::Error;

use crate::storage::error::StorageError;

/// Errors that can occur in job board operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task failed validation.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// No task with the given id exists.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task is no longer open.
    #[error("task {task_id} already claimed{}", assignee.as_deref().map(|a| format!(" by {}", a)).unwrap_or_default())]
    AlreadyClaimed {
        /// Task that was contested.
        task_id: String,
        /// Current assignee, when known.
        assignee: Option<String>,
    },

    /// One or more dependencies are not `done`.
    #[error("dependencies unmet: {0:?}")]
    DependenciesUnmet(Vec<String>),

    /// The requested status change is not permitted.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

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

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        TaskError::Storage(StorageError::Connection(err))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Storage(StorageError::Serialization(err))
    }
}

/// Result type for job board operations.
pub type Result<T> = std::result::Result<T, TaskError>;
