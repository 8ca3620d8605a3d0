//! Quorum Core - coordination substrate for fleets of cooperating agents.
//!
//! This crate provides the message broker and work-coordination engine
//! backing a fleet of agents, including:
//! - Message submission, subscription-based delivery, and atomic claim
//! - Broadcast fan-out with per-recipient delivery tracking
//! - Request/response correlation (`ask`/`reply`)
//! - A transactional job board with dependency gating
//! - Voting with simple-majority, weighted, and consensus tallies
//! - An agent health registry and an append-only audit log
//!
//! Everything persists in one embedded SQLite file; correctness under
//! concurrent callers comes from the store's writer serialization, not
//! from locks in this crate.
//!
//! # Example
//!
//! ```rust,no_run
//! use quorum_core::{CoordinationConfig, Coordinator, MessageKind};
//! use std::time::Duration;
//!
//! fn main() -> quorum_core::Result<()> {
//!     let coordinator = Coordinator::open(CoordinationConfig::at(".quorum"))?;
//!     let agent = coordinator.messenger("frontend-dev-01")?;
//!
//!     let response = agent.ask(
//!         "context-manager",
//!         MessageKind::ContextQuery,
//!         serde_json::json!({"query": "frontend framework?"}),
//!         Duration::from_secs(30),
//!     )?;
//!     println!("context: {}", response);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod broker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod limits;
pub mod maintenance;
pub mod messenger;
pub mod registry;
pub mod storage;
pub mod voting;

pub use audit::{AuditEvent, AuditFilter, AuditKind, AuditLog};
pub use broker::{
    BroadcastTracker, BrokerError, DeliveryRecord, DeliveryStats, DeliveryStatus, Message,
    MessageBroker, MessageKind, MessageStatus, Submit, DEFAULT_ASK_TIMEOUT, PROTOCOL_VERSION,
};
pub use config::CoordinationConfig;
pub use coordinator::Coordinator;
pub use error::{QuorumError, Result};
pub use jobs::{HistoryEntry, JobBoard, NewTask, Task, TaskError, TaskStatus};
pub use limits::{CircuitBreaker, CircuitState, RateLimiter};
pub use maintenance::{MaintenanceReport, MaintenanceService};
pub use messenger::AgentMessenger;
pub use registry::{AgentHealth, AgentRegistry, AgentState, Liveness, RegistryError};
pub use storage::{Database, StorageError};
pub use voting::{
    Ballot, Blocker, NewVote, Stance, TallyResult, Vote, VoteError, VoteMechanism, VoteOutcome,
    VoteStatus, VotingEngine,
};
