//! Broadcast delivery tracking.
//!
//! One row per (message, recipient), written at submit time. Used by the
//! voting engine to find voters that have not acted and by monitoring to
//! diagnose fan-out coverage.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::broker::error::{BrokerError, Result};
use crate::broker::message::DeliveryStatus;
use crate::clock;
use crate::storage::{self, SharedDatabase};

/// Counts of delivery rows by state for one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Rows still waiting on the recipient.
    pub delivered: u32,
    /// Rows the recipient claimed.
    pub acknowledged: u32,
    /// Rows the recipient dismissed.
    pub skipped: u32,
}

/// One recipient's delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Recipient agent id.
    pub agent_id: String,
    /// Current delivery state.
    pub status: DeliveryStatus,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

/// Read handle over broadcast delivery rows.
#[derive(Clone)]
pub struct BroadcastTracker {
    db: SharedDatabase,
}

impl BroadcastTracker {
    pub(crate) fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Counts deliveries by state for a broadcast.
    ///
    /// # Errors
    /// * `NotFound` if no such message exists
    pub fn status(&self, message_id: &str) -> Result<DeliveryStats> {
        let db = storage::lock(&self.db)?;
        let exists: bool = db.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?)",
            [message_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(BrokerError::NotFound(message_id.to_string()));
        }

        let mut stmt = db.conn().prepare(
            "SELECT status, COUNT(*) FROM broadcast_deliveries \
              WHERE message_id = ? GROUP BY status",
        )?;
        let mut stats = DeliveryStats::default();
        let rows = stmt.query_map([message_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match DeliveryStatus::parse(&status) {
                Some(DeliveryStatus::Delivered) => stats.delivered = count as u32,
                Some(DeliveryStatus::Acknowledged) => stats.acknowledged = count as u32,
                Some(DeliveryStatus::Skipped) => stats.skipped = count as u32,
                None => {}
            }
        }
        Ok(stats)
    }

    /// Enumerates the recipients of a broadcast with their states.
    pub fn recipients(&self, message_id: &str) -> Result<Vec<DeliveryRecord>> {
        let db = storage::lock(&self.db)?;
        let mut stmt = db.conn().prepare(
            "SELECT agent_id, status, updated_at FROM broadcast_deliveries \
              WHERE message_id = ? ORDER BY agent_id",
        )?;
        let records = stmt
            .query_map([message_id], |row| {
                let status: String = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok(DeliveryRecord {
                    agent_id: row.get(0)?,
                    status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Delivered),
                    updated_at: clock::from_iso(&updated_at).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Returns one recipient's delivery state, or `None` if the recipient
    /// was not subscribed when the broadcast was submitted.
    pub fn recipient_state(
        &self,
        message_id: &str,
        agent_id: &str,
    ) -> Result<Option<DeliveryStatus>> {
        let db = storage::lock(&self.db)?;
        let status: Option<String> = db
            .conn()
            .query_row(
                "SELECT status FROM broadcast_deliveries WHERE message_id = ? AND agent_id = ?",
                [message_id, agent_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(DeliveryStatus::parse))
    }
}
