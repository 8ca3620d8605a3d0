//! Error types for the voting engine.

use thiserror::Error;

use crate::storage::error::StorageError;

/// Errors that can occur in voting operations.
#[derive(Debug, Error)]
pub enum VoteError {
    /// The vote or ballot failed validation.
    #[error("invalid vote: {0}")]
    InvalidVote(String),

    /// Fewer eligible voters than the minimum.
    #[error("insufficient voters: got {got}, need at least {need}")]
    InsufficientVoters {
        /// Voters supplied.
        got: usize,
        /// Minimum required.
        need: usize,
    },

    /// No vote with the given id exists.
    #[error("vote not found: {0}")]
    NotFound(String),

    /// The voter is not in the eligible set.
    #[error("agent {voter} is not eligible to vote")]
    NotEligible {
        /// The ineligible agent.
        voter: String,
    },

    /// The voter already cast a ballot.
    #[error("agent {voter} already voted")]
    AlreadyVoted {
        /// The repeat voter.
        voter: String,
    },

    /// The vote is closed, cancelled, or past its deadline.
    #[error("vote closed: {0}")]
    VoteClosed(String),

    /// The proposer's or voter's token bucket is exhausted.
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

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<rusqlite::Error> for VoteError {
    fn from(err: rusqlite::Error) -> Self {
        VoteError::Storage(StorageError::Connection(err))
    }
}

impl From<serde_json::Error> for VoteError {
    fn from(err: serde_json::Error) -> Self {
        VoteError::Storage(StorageError::Serialization(err))
    }
}

/// Result type for voting operations.
pub type Result<T> = std::result::Result<T, VoteError>;
