//! Top-level handle wiring the subsystems to one store.

use std::fs;
use std::sync::{Arc, Mutex};

use rusqlite::params;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::AuditLog;
use crate::broker::{BroadcastTracker, MessageBroker};
use crate::clock;
use crate::config::CoordinationConfig;
use crate::error::{QuorumError, Result};
use crate::jobs::JobBoard;
use crate::limits::{CircuitBreaker, RateLimiter};
use crate::maintenance::MaintenanceService;
use crate::messenger::AgentMessenger;
use crate::registry::{AgentRegistry, SYSTEM_AGENT};
use crate::storage::{self, Database, RetryPolicy, SharedDatabase};
use crate::voting::VotingEngine;

/// Entry point to the coordination substrate.
///
/// Owns the shared database handle and the process-local guards, and hands
/// out cheap clones of the subsystem services. Everything operates on one
/// SQLite file, so cross-subsystem effects (a vote broadcasting messages,
/// an audit record for a task claim) commit atomically.
pub struct Coordinator {
    config: CoordinationConfig,
    db: SharedDatabase,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl Coordinator {
    /// Opens (or creates) the coordination state directory.
    ///
    /// Lays out the root directory: the database file, the artifacts
    /// subdirectory, and the protocol version file. Re-opening an existing
    /// directory is idempotent.
    ///
    /// # Errors
    /// * `Config` if the directory holds a different protocol version
    pub fn open(config: CoordinationConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir)?;
        fs::create_dir_all(config.artifacts_path())?;

        let version_path = config.version_path();
        if version_path.exists() {
            let found = fs::read_to_string(&version_path)?.trim().to_string();
            if found != config.protocol_version {
                return Err(QuorumError::Config(format!(
                    "protocol version mismatch: store has {}, expected {}",
                    found, config.protocol_version
                )));
            }
        } else {
            fs::write(&version_path, &config.protocol_version)?;
        }

        let db = Database::open_with(
            &config.database_path(),
            config.busy_timeout(),
            RetryPolicy::default(),
        )
        .map_err(QuorumError::Storage)?;
        let coordinator = Self::assemble(config, db)?;
        info!(root = %coordinator.config.root_dir.display(), "coordination substrate ready");
        Ok(coordinator)
    }

    /// Opens an in-memory substrate for tests.
    pub fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory().map_err(QuorumError::Storage)?;
        Self::assemble(CoordinationConfig::default(), db)
    }

    fn assemble(config: CoordinationConfig, db: Database) -> Result<Self> {
        let db: SharedDatabase = Arc::new(Mutex::new(db));
        seed_default_channels(&db, &config.default_channels)?;

        let limiter =
            Arc::new(RateLimiter::new(config.rate_capacity, config.rate_refill_per_sec));
        let breaker = Arc::new(CircuitBreaker::with_settings(
            config.breaker_threshold,
            std::time::Duration::from_secs(config.breaker_cooldown_secs),
        ));
        Ok(Self { config, db, limiter, breaker })
    }

    /// The configuration this substrate was opened with.
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Message broker handle.
    pub fn broker(&self) -> MessageBroker {
        MessageBroker::new(self.db.clone(), self.limiter.clone(), self.breaker.clone())
    }

    /// Broadcast delivery tracker handle.
    pub fn broadcasts(&self) -> BroadcastTracker {
        BroadcastTracker::new(self.db.clone())
    }

    /// Job board handle.
    pub fn board(&self) -> JobBoard {
        JobBoard::new(self.db.clone(), self.breaker.clone())
    }

    /// Voting engine handle.
    pub fn voting(&self) -> VotingEngine {
        VotingEngine::new(self.db.clone(), self.limiter.clone(), self.breaker.clone())
    }

    /// Agent registry handle.
    pub fn registry(&self) -> AgentRegistry {
        AgentRegistry::with_windows(
            self.db.clone(),
            self.breaker.clone(),
            std::time::Duration::from_secs(self.config.heartbeat_active_secs),
            std::time::Duration::from_secs(self.config.heartbeat_degraded_secs),
        )
    }

    /// Audit log handle.
    pub fn audit(&self) -> AuditLog {
        AuditLog::new(self.db.clone())
    }

    /// Maintenance service handle.
    pub fn maintenance(&self) -> MaintenanceService {
        MaintenanceService::new(self.db.clone(), self.config.checkpoint_threshold_pages)
    }

    /// Spawns the periodic maintenance loop on the current tokio runtime.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.maintenance().spawn(self.config.maintenance_interval())
    }

    /// Creates an agent-facing messenger: registers a heartbeat and
    /// subscribes the agent to `general`.
    pub fn messenger(&self, agent_id: impl Into<String>) -> Result<AgentMessenger> {
        AgentMessenger::connect(self, agent_id.into())
    }
}

fn seed_default_channels(db: &SharedDatabase, channels: &[String]) -> Result<()> {
    let mut db = storage::lock(db).map_err(QuorumError::Storage)?;
    db.immediate(|tx| {
        for channel in channels {
            tx.execute(
                "INSERT OR IGNORE INTO channel_subscriptions \
                 (channel_name, agent_id, subscribed_at) VALUES (?, ?, ?)",
                params![channel, SYSTEM_AGENT, clock::now_iso()],
            )?;
        }
        Ok(())
    })
    .map_err(QuorumError::Storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_seeds_default_channels() {
        let coordinator = Coordinator::in_memory().unwrap();
        let registry = coordinator.registry();
        let channels = registry.channels(SYSTEM_AGENT).unwrap();
        assert_eq!(channels, vec!["general", "review", "technical", "urgent"]);
    }

    #[test]
    fn test_open_lays_out_state_directory() {
        let dir = std::env::temp_dir().join(format!("quorum-coord-{}", clock::new_id()));
        let config = CoordinationConfig::at(&dir);
        let _coordinator = Coordinator::open(config.clone()).unwrap();

        assert!(config.database_path().exists());
        assert!(config.artifacts_path().is_dir());
        assert_eq!(
            std::fs::read_to_string(config.version_path()).unwrap().trim(),
            "1.0"
        );

        // Re-opening is idempotent.
        drop(_coordinator);
        let _again = Coordinator::open(config).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_open_rejects_version_mismatch() {
        let dir = std::env::temp_dir().join(format!("quorum-coord-{}", clock::new_id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("protocol_version"), "0.9").unwrap();

        let result = Coordinator::open(CoordinationConfig::at(&dir));
        assert!(matches!(result, Err(QuorumError::Config(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
