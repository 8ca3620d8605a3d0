//! Agent health registry and channel subscriptions.
//!
//! Agents exist from their first heartbeat. Liveness is a read-side
//! classification over the last heartbeat timestamp; nothing marks an
//! agent stale in the store.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{self, AuditKind};
use crate::clock;
use crate::limits::CircuitBreaker;
use crate::storage::{self, Database, SharedDatabase, StorageResult};

pub use error::{RegistryError, Result};

/// Reserved agent id used to seed default channels.
pub const SYSTEM_AGENT: &str = "system";

/// Self-reported agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Working.
    Active,
    /// Alive but unoccupied.
    Idle,
    /// Alive but impaired.
    Degraded,
    /// Reported a terminal failure.
    Failed,
    /// Registered, no work yet.
    Registered,
}

impl AgentState {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Active => "active",
            AgentState::Idle => "idle",
            AgentState::Degraded => "degraded",
            AgentState::Failed => "failed",
            AgentState::Registered => "registered",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentState::Active),
            "idle" => Some(AgentState::Idle),
            "degraded" => Some(AgentState::Degraded),
            "failed" => Some(AgentState::Failed),
            "registered" => Some(AgentState::Registered),
            _ => None,
        }
    }
}

/// Liveness derived from heartbeat age, not from self-reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Heartbeat within the active window.
    Active,
    /// Heartbeat within the degraded window.
    Degraded,
    /// No recent heartbeat; probably dead.
    Stale,
}

/// An agent's registry row plus derived liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent id.
    pub agent_id: String,
    /// Self-reported status from the last heartbeat.
    pub status: AgentState,
    /// What the agent said it was doing.
    pub current_task: Option<String>,
    /// Last heartbeat timestamp.
    pub last_heartbeat: DateTime<Utc>,
    /// Direct messages waiting for this agent.
    pub messages_pending: u32,
    /// Messages this agent completed.
    pub messages_processed: u32,
    /// Completions that carried an error.
    pub error_count: u32,
    /// Derived liveness classification.
    pub liveness: Liveness,
}

/// Agent registry over the shared store.
#[derive(Clone)]
pub struct AgentRegistry {
    db: SharedDatabase,
    breaker: Arc<CircuitBreaker>,
    active_window: Duration,
    degraded_window: Duration,
}

impl AgentRegistry {
    /// Creates a registry with the default liveness windows (60 s active,
    /// 300 s degraded).
    pub fn new(db: SharedDatabase, breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_windows(db, breaker, Duration::from_secs(60), Duration::from_secs(300))
    }

    /// Creates a registry with explicit liveness windows.
    pub fn with_windows(
        db: SharedDatabase,
        breaker: Arc<CircuitBreaker>,
        active_window: Duration,
        degraded_window: Duration,
    ) -> Self {
        Self { db, breaker, active_window, degraded_window }
    }

    fn guarded<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        if !self.breaker.check(operation) {
            return Err(RegistryError::CircuitOpen { operation: operation.to_string() });
        }
        let result = {
            let mut db = storage::lock(&self.db)?;
            f(&mut db)
        };
        match &result {
            Ok(_) => self.breaker.record_success(operation),
            Err(RegistryError::Storage(_)) => self.breaker.record_failure(operation),
            Err(_) => {}
        }
        result
    }

    /// Records a heartbeat, creating the agent row on first contact.
    /// Idempotent: repeated calls only move the timestamp.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        status: AgentState,
        current_task: Option<&str>,
    ) -> Result<()> {
        let agent_id = agent_id.to_string();
        let current_task = current_task.map(str::to_string);

        self.guarded("registry.heartbeat", |db| {
            db.immediate(|tx| {
                tx.execute(
                    "INSERT INTO agent_status (agent_id, status, current_task, last_heartbeat) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(agent_id) DO UPDATE SET \
                        status = excluded.status, \
                        current_task = excluded.current_task, \
                        last_heartbeat = excluded.last_heartbeat",
                    params![agent_id, status.as_str(), current_task, clock::now_iso()],
                )?;
                audit::record(tx, &agent_id, AuditKind::Heartbeat, status.as_str())?;
                Ok(())
            })?;
            debug!(agent_id = %agent_id, status = status.as_str(), "heartbeat");
            Ok(())
        })
    }

    /// Returns an agent's health row with derived liveness.
    ///
    /// # Errors
    /// * `NotFound` if the agent never sent a heartbeat
    pub fn health(&self, agent_id: &str) -> Result<AgentHealth> {
        let db = storage::lock(&self.db)?;
        let health = db
            .conn()
            .query_row(
                "SELECT agent_id, status, current_task, last_heartbeat, messages_pending, \
                 messages_processed, error_count FROM agent_status WHERE agent_id = ?",
                [agent_id],
                |row| self.health_from_row(row),
            )
            .optional()?;
        health.ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    /// Lists all known agents with derived liveness.
    pub fn agents(&self) -> Result<Vec<AgentHealth>> {
        let db = storage::lock(&self.db)?;
        let mut stmt = db.conn().prepare(
            "SELECT agent_id, status, current_task, last_heartbeat, messages_pending, \
             messages_processed, error_count FROM agent_status ORDER BY agent_id",
        )?;
        let agents = stmt
            .query_map([], |row| self.health_from_row(row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    /// Deletes an agent row and its channel subscriptions.
    pub fn deregister(&self, agent_id: &str) -> Result<()> {
        let agent_id = agent_id.to_string();
        self.guarded("registry.deregister", |db| {
            db.immediate(|tx| {
                tx.execute("DELETE FROM agent_status WHERE agent_id = ?", [&agent_id])?;
                tx.execute(
                    "DELETE FROM channel_subscriptions WHERE agent_id = ?",
                    [&agent_id],
                )?;
                Ok(())
            })?;
            Ok(())
        })
    }

    /// Subscribes an agent to a channel. Idempotent; does not create
    /// delivery rows for broadcasts already submitted.
    pub fn subscribe(&self, agent_id: &str, channel: &str) -> Result<()> {
        let agent_id = agent_id.to_string();
        let channel = channel.to_string();

        self.guarded("registry.subscribe", |db| {
            db.immediate(|tx| {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO channel_subscriptions \
                     (channel_name, agent_id, subscribed_at) VALUES (?, ?, ?)",
                    params![channel, agent_id, clock::now_iso()],
                )?;
                if inserted == 1 {
                    audit::record(tx, &agent_id, AuditKind::ChannelSubscribe, &channel)?;
                }
                Ok(())
            })?;
            Ok(())
        })
    }

    /// Unsubscribes an agent from a channel. Idempotent.
    pub fn unsubscribe(&self, agent_id: &str, channel: &str) -> Result<()> {
        let agent_id = agent_id.to_string();
        let channel = channel.to_string();

        self.guarded("registry.unsubscribe", |db| {
            db.immediate(|tx| {
                let removed = tx.execute(
                    "DELETE FROM channel_subscriptions WHERE channel_name = ? AND agent_id = ?",
                    params![channel, agent_id],
                )?;
                if removed == 1 {
                    audit::record(tx, &agent_id, AuditKind::ChannelUnsubscribe, &channel)?;
                }
                Ok(())
            })?;
            Ok(())
        })
    }

    /// Returns the channels an agent is subscribed to, sorted.
    pub fn channels(&self, agent_id: &str) -> Result<Vec<String>> {
        let db = storage::lock(&self.db)?;
        let mut stmt = db.conn().prepare(
            "SELECT channel_name FROM channel_subscriptions WHERE agent_id = ? \
             ORDER BY channel_name",
        )?;
        let channels = stmt
            .query_map([agent_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    fn health_from_row(&self, row: &Row<'_>) -> rusqlite::Result<AgentHealth> {
        let status: String = row.get(1)?;
        let last_heartbeat: String = row.get(3)?;
        let last_heartbeat = clock::from_iso(&last_heartbeat).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let age = (clock::now() - last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        let liveness = if age <= self.active_window {
            Liveness::Active
        } else if age <= self.degraded_window {
            Liveness::Degraded
        } else {
            Liveness::Stale
        };

        Ok(AgentHealth {
            agent_id: row.get(0)?,
            status: AgentState::parse(&status).unwrap_or(AgentState::Registered),
            current_task: row.get(2)?,
            last_heartbeat,
            messages_pending: row.get::<_, i64>(4)?.max(0) as u32,
            messages_processed: row.get::<_, i64>(5)?.max(0) as u32,
            error_count: row.get::<_, i64>(6)?.max(0) as u32,
            liveness,
        })
    }
}
