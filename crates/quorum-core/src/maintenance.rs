//! Background maintenance: expiration, dead-letter sweep, checkpointing.
//!
//! One maintenance loop runs per process. Each pass is a handful of small
//! immediate transactions, never one long one, so agent operations are not
//! starved of the writer lock.

use std::time::Duration;

use rusqlite::params;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditKind};
use crate::clock;
use crate::storage::{self, SharedDatabase, StorageResult};

/// What a maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired messages removed (with their delivery rows).
    pub expired_messages: usize,
    /// Failed messages moved to the dead-letter archive.
    pub dead_lettered: usize,
    /// Whether a WAL checkpoint ran.
    pub checkpointed: bool,
}

/// Maintenance service over the shared store.
#[derive(Clone)]
pub struct MaintenanceService {
    db: SharedDatabase,
    checkpoint_threshold_pages: u64,
}

impl MaintenanceService {
    /// Creates a maintenance service; a checkpoint runs once the freelist
    /// exceeds `checkpoint_threshold_pages`.
    pub fn new(db: SharedDatabase, checkpoint_threshold_pages: u64) -> Self {
        Self { db, checkpoint_threshold_pages }
    }

    /// Runs one maintenance pass.
    pub fn run_once(&self) -> StorageResult<MaintenanceReport> {
        let report = MaintenanceReport {
            expired_messages: self.sweep_expired()?,
            dead_lettered: self.sweep_failed()?,
            checkpointed: self.maybe_checkpoint()?,
        };

        if report.expired_messages > 0 || report.dead_lettered > 0 {
            info!(
                expired = report.expired_messages,
                dead_lettered = report.dead_lettered,
                "maintenance pass"
            );
        } else {
            debug!("maintenance pass: nothing to do");
        }
        Ok(report)
    }

    /// Spawns the periodic loop on the current tokio runtime.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let service = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || service.run_once()).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "maintenance pass failed"),
                    Err(err) => warn!(error = %err, "maintenance task panicked"),
                }
            }
        })
    }

    /// Deletes messages past their TTL together with their delivery rows.
    fn sweep_expired(&self) -> StorageResult<usize> {
        let mut db = storage::lock(&self.db)?;
        db.immediate(|tx| {
            let now = clock::now_iso();
            tx.execute(
                "DELETE FROM broadcast_deliveries WHERE message_id IN \
                 (SELECT id FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?)",
                params![now],
            )?;
            let removed = tx.execute(
                "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?",
                params![now],
            )?;
            if removed > 0 {
                audit::record(
                    tx,
                    "maintenance",
                    AuditKind::Maintenance,
                    &format!("expired {} messages", removed),
                )?;
            }
            Ok(removed)
        })
    }

    /// Moves failed messages with three or more deliveries into the
    /// dead-letter archive.
    fn sweep_failed(&self) -> StorageResult<usize> {
        use crate::broker::broker::{message_from_row, MESSAGE_COLUMNS};

        let mut db = storage::lock(&self.db)?;
        db.immediate(|tx| {
            let candidates = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                      WHERE status = 'failed' AND delivery_count >= 3"
                ))?;
                let rows = stmt
                    .query_map([], message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            for msg in &candidates {
                tx.execute(
                    "INSERT INTO dead_letter (id, message_id, envelope, error, retry_count, moved_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        clock::new_id(),
                        msg.id,
                        serde_json::to_string(msg)?,
                        msg.error.as_deref().unwrap_or("unknown"),
                        msg.delivery_count as i64,
                        clock::now_iso(),
                    ],
                )?;
                tx.execute("DELETE FROM messages WHERE id = ?", [&msg.id])?;
            }
            if !candidates.is_empty() {
                audit::record(
                    tx,
                    "maintenance",
                    AuditKind::Maintenance,
                    &format!("dead-lettered {} messages", candidates.len()),
                )?;
            }
            Ok(candidates.len())
        })
    }

    /// Truncates the WAL once enough pages have been freed.
    fn maybe_checkpoint(&self) -> StorageResult<bool> {
        let db = storage::lock(&self.db)?;
        let freelist: u64 = db
            .conn()
            .query_row("PRAGMA freelist_count", [], |row| row.get(0))
            .unwrap_or(0);
        if freelist <= self.checkpoint_threshold_pages {
            return Ok(false);
        }
        // In-memory stores have no WAL; ignore checkpoint errors there.
        let _ = db.conn().query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()));
        debug!(freelist, "WAL checkpoint");
        Ok(true)
    }

    /// Number of rows currently in the dead-letter archive.
    pub fn dead_letter_count(&self) -> StorageResult<usize> {
        let db = storage::lock(&self.db)?;
        let count: i64 =
            db.conn().query_row("SELECT COUNT(*) FROM dead_letter", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
