//! Crate-level error type.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::jobs::TaskError;
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::voting::VoteError;

/// Aggregate error for coordination operations.
#[derive(Debug, Error)]
pub enum QuorumError {
    /// Message broker error.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Job board error.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Voting error.
    #[error(transparent)]
    Vote(#[from] VoteError),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration problem (bad layout, version mismatch).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error while preparing the state directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_errors_convert() {
        let err: QuorumError = BrokerError::NotFound("m1".to_string()).into();
        assert!(matches!(err, QuorumError::Broker(_)));

        let err: QuorumError = TaskError::NotFound("t1".to_string()).into();
        assert!(matches!(err, QuorumError::Task(_)));

        let err: QuorumError = StorageError::NotFound("row".to_string()).into();
        assert!(matches!(err, QuorumError::Storage(_)));
    }

    #[test]
    fn test_transparent_display() {
        let err: QuorumError = BrokerError::NotFound("m1".to_string()).into();
        assert_eq!(format!("{}", err), "message not found: m1");
    }
}
