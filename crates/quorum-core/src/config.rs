//! Configuration for the coordination substrate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Coordinator`](crate::Coordinator).
///
/// The defaults match the protocol contract; most deployments only set
/// `root_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Directory holding the database, artifacts, and version file.
    pub root_dir: PathBuf,
    /// Database file name inside `root_dir`.
    pub database_file: String,
    /// Artifacts subdirectory name inside `root_dir`.
    pub artifacts_dir: String,
    /// Protocol version written to (and checked against) the version file.
    pub protocol_version: String,
    /// Channels seeded at initialization.
    pub default_channels: Vec<String>,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Maintenance loop interval in seconds.
    pub maintenance_interval_secs: u64,
    /// Freed pages before a WAL checkpoint runs.
    pub checkpoint_threshold_pages: u64,
    /// Tasks in `assigned`/`in-progress` older than this are stale (seconds).
    pub stale_task_threshold_secs: u64,
    /// Heartbeat age (seconds) within which an agent counts as active.
    pub heartbeat_active_secs: u64,
    /// Heartbeat age (seconds) within which an agent counts as degraded.
    pub heartbeat_degraded_secs: u64,
    /// Rate limiter bucket capacity per agent.
    pub rate_capacity: u32,
    /// Rate limiter refill, tokens per second.
    pub rate_refill_per_sec: u32,
    /// Consecutive failures that trip a circuit.
    pub breaker_threshold: u32,
    /// Seconds an open circuit stays open before a probe.
    pub breaker_cooldown_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".quorum"),
            database_file: "quorum.db".to_string(),
            artifacts_dir: "artifacts".to_string(),
            protocol_version: "1.0".to_string(),
            default_channels: vec![
                "general".to_string(),
                "urgent".to_string(),
                "technical".to_string(),
                "review".to_string(),
            ],
            busy_timeout_ms: 5_000,
            maintenance_interval_secs: 60,
            checkpoint_threshold_pages: 64,
            stale_task_threshold_secs: 24 * 60 * 60,
            heartbeat_active_secs: 60,
            heartbeat_degraded_secs: 300,
            rate_capacity: 100,
            rate_refill_per_sec: 10,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
        }
    }
}

impl CoordinationConfig {
    /// Config rooted at the given directory, everything else default.
    pub fn at(root_dir: impl Into<PathBuf>) -> Self {
        Self { root_dir: root_dir.into(), ..Self::default() }
    }

    /// Path to the database file.
    pub fn database_path(&self) -> PathBuf {
        self.root_dir.join(&self.database_file)
    }

    /// Path to the artifacts directory.
    pub fn artifacts_path(&self) -> PathBuf {
        self.root_dir.join(&self.artifacts_dir)
    }

    /// Path to the protocol version file.
    pub fn version_path(&self) -> PathBuf {
        self.root_dir.join("protocol_version")
    }

    /// Busy timeout as a [`Duration`].
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Maintenance interval as a [`Duration`].
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Stale-task threshold as a [`Duration`].
    pub fn stale_task_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_task_threshold_secs)
    }

    /// Loads a config from a JSON file.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }
}
