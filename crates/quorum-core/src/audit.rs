//! Append-only audit log.
//!
//! Every state-changing operation writes one audit record inside the same
//! transaction as the change, so append order under the single-writer lock
//! is commit order. Records are never updated or deleted.

use chrono::{DateTime, Utc};
use rusqlite::{params, Transaction};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::storage::{self, SharedDatabase, StorageResult};

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    MessageSubmit,
    MessageClaim,
    MessageComplete,
    MessageReply,
    MessageDismiss,
    TaskCreate,
    TaskClaim,
    TaskUpdate,
    TaskComplete,
    TaskRelease,
    VoteInitiate,
    VoteCast,
    VoteTally,
    VoteCancel,
    Heartbeat,
    ChannelSubscribe,
    ChannelUnsubscribe,
    Maintenance,
}

impl AuditKind {
    /// The dotted label stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::MessageSubmit => "message.submit",
            AuditKind::MessageClaim => "message.claim",
            AuditKind::MessageComplete => "message.complete",
            AuditKind::MessageReply => "message.reply",
            AuditKind::MessageDismiss => "message.dismiss",
            AuditKind::TaskCreate => "task.create",
            AuditKind::TaskClaim => "task.claim",
            AuditKind::TaskUpdate => "task.update",
            AuditKind::TaskComplete => "task.complete",
            AuditKind::TaskRelease => "task.release",
            AuditKind::VoteInitiate => "vote.initiate",
            AuditKind::VoteCast => "vote.cast",
            AuditKind::VoteTally => "vote.tally",
            AuditKind::VoteCancel => "vote.cancel",
            AuditKind::Heartbeat => "agent.heartbeat",
            AuditKind::ChannelSubscribe => "channel.subscribe",
            AuditKind::ChannelUnsubscribe => "channel.unsubscribe",
            AuditKind::Maintenance => "maintenance.sweep",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic row id (append order).
    pub id: i64,
    /// When the record was written.
    pub at: DateTime<Utc>,
    /// Agent (or subsystem) that performed the operation.
    pub actor: String,
    /// Event kind label.
    pub kind: String,
    /// Short human-readable summary.
    pub summary: String,
}

/// Appends an audit record inside the caller's transaction.
pub(crate) fn record(
    tx: &Transaction,
    actor: &str,
    kind: AuditKind,
    summary: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO audit (at, actor, kind, summary) VALUES (?, ?, ?, ?)",
        params![clock::now_iso(), actor, kind.as_str(), summary],
    )?;
    Ok(())
}

/// Filter for audit queries. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only events by this actor.
    pub actor: Option<String>,
    /// Only events of this kind label.
    pub kind: Option<String>,
    /// Only events at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Maximum events to return (default 100).
    pub limit: Option<usize>,
}

/// Read handle over the audit table.
#[derive(Clone)]
pub struct AuditLog {
    db: SharedDatabase,
}

impl AuditLog {
    pub(crate) fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Queries audit events, newest first.
    pub fn query(&self, filter: &AuditFilter) -> StorageResult<Vec<AuditEvent>> {
        let db = storage::lock(&self.db)?;

        let mut sql =
            String::from("SELECT id, at, actor, kind, summary FROM audit WHERE 1=1");
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(actor) = &filter.actor {
            sql.push_str(" AND actor = ?");
            params.push(actor.clone().into());
        }
        if let Some(kind) = &filter.kind {
            sql.push_str(" AND kind = ?");
            params.push(kind.clone().into());
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND at >= ?");
            params.push(clock::to_iso(since).into());
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params.push((filter.limit.unwrap_or(100) as i64).into());

        let mut stmt = db.conn().prepare(&sql)?;
        let events = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                let at: String = row.get(1)?;
                Ok(AuditEvent {
                    id: row.get(0)?,
                    at: clock::from_iso(&at).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    actor: row.get(2)?,
                    kind: row.get(3)?,
                    summary: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Convenience: all events of one kind, newest first.
    pub fn by_kind(&self, kind: &str, limit: usize) -> StorageResult<Vec<AuditEvent>> {
        self.query(&AuditFilter {
            kind: Some(kind.to_string()),
            limit: Some(limit),
            ..AuditFilter::default()
        })
    }
}
