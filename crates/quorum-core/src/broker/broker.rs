//! Message broker: submit, peek, claim, complete, reply, ask.
//!
//! Every mutating operation is one immediate transaction; claim races are
//! resolved by the store. The claim of a pending direct message is the
//! exactly-once-delivery pivot: among concurrent claimants exactly one
//! observes `pending` and commits the transition to `processing`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{self, AuditKind};
use crate::broker::error::{BrokerError, Result};
use crate::broker::message::{
    Message, MessageKind, MessageStatus, Submit, PROTOCOL_VERSION,
};
use crate::clock;
use crate::limits::{CircuitBreaker, RateLimiter};
use crate::storage::{self, Database, SharedDatabase, StorageResult};

pub(crate) const MESSAGE_COLUMNS: &str = "id, kind, version, correlation_id, from_agent, \
     to_agent, channel, priority, payload, status, created_at, expires_at, delivery_count, \
     last_delivered_at, error";

/// Default overall timeout for [`MessageBroker::ask`].
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(30);

fn text_conversion(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Maps a row selected with [`MESSAGE_COLUMNS`] to a [`Message`].
pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(1)?;
    let payload: String = row.get(8)?;
    let status: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let expires_at: Option<String> = row.get(11)?;
    let last_delivered_at: Option<String> = row.get(13)?;

    Ok(Message {
        id: row.get(0)?,
        kind: MessageKind::from_label(&kind),
        version: row.get(2)?,
        correlation_id: row.get(3)?,
        from_agent: row.get(4)?,
        to_agent: row.get(5)?,
        channel: row.get(6)?,
        priority: row.get::<_, i64>(7)? as u8,
        payload: serde_json::from_str(&payload).map_err(|e| text_conversion(8, e))?,
        status: MessageStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(9, "status".to_string(), rusqlite::types::Type::Text)
        })?,
        created_at: clock::from_iso(&created_at).map_err(|e| text_conversion(10, e))?,
        expires_at: expires_at
            .map(|s| clock::from_iso(&s).map_err(|e| text_conversion(11, e)))
            .transpose()?,
        delivery_count: row.get::<_, i64>(12)? as u32,
        last_delivered_at: last_delivered_at
            .map(|s| clock::from_iso(&s).map_err(|e| text_conversion(13, e)))
            .transpose()?,
        error: row.get(14)?,
    })
}

/// Inserts a fully-formed envelope. Used by the broker and by subsystems
/// that enqueue follow-up messages inside their own transactions.
pub(crate) fn insert_message(tx: &Transaction, msg: &Message) -> StorageResult<()> {
    tx.execute(
        "INSERT INTO messages (id, kind, version, correlation_id, from_agent, to_agent, \
         channel, priority, payload, status, created_at, expires_at, delivery_count, \
         last_delivered_at, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            msg.id,
            msg.kind.label(),
            msg.version,
            msg.correlation_id,
            msg.from_agent,
            msg.to_agent,
            msg.channel,
            msg.priority as i64,
            serde_json::to_string(&msg.payload)?,
            msg.status.as_str(),
            clock::to_iso(msg.created_at),
            msg.expires_at.map(clock::to_iso),
            msg.delivery_count as i64,
            msg.last_delivered_at.map(clock::to_iso),
            msg.error,
        ],
    )?;
    Ok(())
}

/// Whether any subscription row (including the seeded `system` marker)
/// exists for the channel.
pub(crate) fn channel_is_known(tx: &Transaction, channel: &str) -> StorageResult<bool> {
    let known: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM channel_subscriptions WHERE channel_name = ?)",
        [channel],
        |row| row.get(0),
    )?;
    Ok(known)
}

/// Materializes one delivery row per current subscriber of the broadcast's
/// channel. `general` implicitly includes every known agent.
pub(crate) fn fan_out(tx: &Transaction, msg: &Message, now: &str) -> StorageResult<usize> {
    let mut stmt = tx.prepare(
        "SELECT agent_id FROM channel_subscriptions \
          WHERE channel_name = ?1 AND agent_id <> 'system' \
         UNION \
         SELECT agent_id FROM agent_status WHERE ?1 = 'general'",
    )?;
    let recipients: Vec<String> = stmt
        .query_map([&msg.channel], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for recipient in &recipients {
        tx.execute(
            "INSERT OR IGNORE INTO broadcast_deliveries (message_id, agent_id, status, updated_at) \
             VALUES (?, ?, 'delivered', ?)",
            params![msg.id, recipient, now],
        )?;
    }
    Ok(recipients.len())
}

/// Builds the envelope for a [`Submit`] request.
pub(crate) fn build_envelope(submit: &Submit) -> Message {
    let now = clock::now();
    Message {
        id: clock::new_id(),
        kind: submit.kind.clone(),
        version: PROTOCOL_VERSION.to_string(),
        correlation_id: submit.correlation_id.clone(),
        from_agent: submit.from_agent.clone(),
        to_agent: submit.to_agent.clone(),
        channel: submit.channel.clone(),
        priority: submit.priority,
        payload: submit.payload.clone(),
        status: MessageStatus::Pending,
        created_at: now,
        expires_at: submit.ttl_secs.map(clock::expiry),
        delivery_count: 0,
        last_delivered_at: None,
        error: None,
    }
}

/// Validates a submit request against the envelope rules.
pub(crate) fn validate_submit(submit: &Submit) -> Result<()> {
    if !(1..=10).contains(&submit.priority) {
        return Err(BrokerError::InvalidMessage(format!(
            "priority must be 1-10, got {}",
            submit.priority
        )));
    }
    if !submit.payload.is_object() {
        return Err(BrokerError::InvalidMessage("payload must be a JSON object".to_string()));
    }
    if submit.from_agent.is_empty() {
        return Err(BrokerError::InvalidMessage("sender must not be empty".to_string()));
    }
    if submit.channel.is_empty() {
        return Err(BrokerError::InvalidMessage("channel must not be empty".to_string()));
    }
    Ok(())
}

/// Message broker over the shared store.
#[derive(Clone)]
pub struct MessageBroker {
    db: SharedDatabase,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl MessageBroker {
    /// Creates a broker over the shared database with the process-local
    /// guards.
    pub fn new(db: SharedDatabase, limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { db, limiter, breaker }
    }

    fn guarded<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        if !self.breaker.check(operation) {
            return Err(BrokerError::CircuitOpen { operation: operation.to_string() });
        }
        let result = {
            let mut db = storage::lock(&self.db)?;
            f(&mut db)
        };
        match &result {
            Ok(_) => self.breaker.record_success(operation),
            Err(BrokerError::Storage(_)) => self.breaker.record_failure(operation),
            Err(_) => {}
        }
        result
    }

    /// Submits a message.
    ///
    /// Direct messages land as a single `pending` row; broadcasts
    /// additionally materialize one delivery row per current subscriber of
    /// the channel. Returns the new message id.
    ///
    /// # Errors
    /// * `InvalidMessage` if validation fails
    /// * `RateLimited` if the sender's token bucket is exhausted
    /// * `UnknownChannel` for a broadcast on a channel with no subscribers
    pub fn submit(&self, submit: Submit) -> Result<String> {
        self.submit_as(submit, AuditKind::MessageSubmit)
    }

    fn submit_as(&self, submit: Submit, audit_kind: AuditKind) -> Result<String> {
        validate_submit(&submit)?;
        if !self.limiter.allow(&submit.from_agent) {
            return Err(BrokerError::RateLimited { agent_id: submit.from_agent });
        }

        self.guarded("broker.submit", |db| {
            let msg = build_envelope(&submit);
            let outcome: StorageResult<Result<String>> = db.immediate(|tx| {
                let now = clock::now_iso();
                if msg.is_broadcast() && !channel_is_known(tx, &msg.channel)? {
                    return Ok(Err(BrokerError::UnknownChannel(msg.channel.clone())));
                }
                insert_message(tx, &msg)?;
                let recipients = if msg.is_broadcast() {
                    fan_out(tx, &msg, &now)?
                } else {
                    // Direct: bump the recipient's pending counter if known.
                    tx.execute(
                        "UPDATE agent_status SET messages_pending = messages_pending + 1 \
                         WHERE agent_id = ?",
                        [msg.to_agent.as_deref().unwrap_or_default()],
                    )?;
                    1
                };
                audit::record(
                    tx,
                    &msg.from_agent,
                    audit_kind,
                    &format!(
                        "{} -> {} on {}",
                        msg.kind,
                        msg.to_agent.as_deref().unwrap_or("*"),
                        msg.channel
                    ),
                )?;
                debug!(
                    message_id = %msg.id,
                    kind = %msg.kind,
                    channel = %msg.channel,
                    recipients,
                    "message submitted"
                );
                Ok(Ok(msg.id.clone()))
            });
            outcome?
        })
    }

    /// Returns pending messages visible to `agent_id` on the given channels,
    /// ordered by priority (descending) then creation time. Read-only.
    pub fn peek(&self, agent_id: &str, channels: &[String], limit: usize) -> Result<Vec<Message>> {
        self.peek_filtered(agent_id, channels, limit, None)
    }

    /// Like [`peek`](Self::peek) with an optional message-kind filter.
    pub fn peek_filtered(
        &self,
        agent_id: &str,
        channels: &[String],
        limit: usize,
        kind: Option<&MessageKind>,
    ) -> Result<Vec<Message>> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let db = storage::lock(&self.db)?;
        let placeholders = vec!["?"; channels.len()].join(",");
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m \
              WHERE m.status = 'pending' \
                AND (m.expires_at IS NULL OR m.expires_at > ?) \
                AND m.channel IN ({placeholders}) \
                AND (m.to_agent = ? \
                     OR (m.to_agent IS NULL AND EXISTS ( \
                           SELECT 1 FROM broadcast_deliveries d \
                            WHERE d.message_id = m.id AND d.agent_id = ? \
                              AND d.status = 'delivered')))"
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        params.push(clock::now_iso().into());
        for channel in channels {
            params.push(channel.clone().into());
        }
        params.push(agent_id.to_string().into());
        params.push(agent_id.to_string().into());
        if let Some(kind) = kind {
            sql.push_str(" AND m.kind = ?");
            params.push(kind.label().to_string().into());
        }
        sql.push_str(" ORDER BY m.priority DESC, m.created_at ASC LIMIT ?");
        params.push((limit as i64).into());

        let mut stmt = db.conn().prepare(&sql)?;
        let messages = stmt
            .query_map(rusqlite::params_from_iter(params), message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Atomically claims a message for `agent_id`.
    ///
    /// Direct messages transition `pending -> processing`; for broadcasts
    /// only the caller's delivery row moves to `acknowledged` and the
    /// message stays visible to other recipients. Returns `false` if the
    /// message was already claimed.
    ///
    /// # Errors
    /// * `NotFound` if no such message exists
    pub fn claim(&self, agent_id: &str, message_id: &str) -> Result<bool> {
        let agent_id = agent_id.to_string();
        let message_id = message_id.to_string();

        self.guarded("broker.claim", |db| {
            let outcome: StorageResult<Result<bool>> = db.immediate(|tx| {
                let row = tx
                    .query_row(
                        "SELECT to_agent, status FROM messages WHERE id = ?",
                        [&message_id],
                        |row| {
                            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
                        },
                    )
                    .optional()?;
                let Some((to_agent, status)) = row else {
                    return Ok(Err(BrokerError::NotFound(message_id.clone())));
                };
                if status != "pending" {
                    return Ok(Ok(false));
                }

                let now = clock::now_iso();
                let claimed = match to_agent {
                    Some(recipient) => {
                        let changed = tx.execute(
                            "UPDATE messages \
                                SET status = 'processing', \
                                    delivery_count = delivery_count + 1, \
                                    last_delivered_at = ? \
                              WHERE id = ? AND status = 'pending'",
                            params![now, message_id],
                        )?;
                        if changed == 1 {
                            tx.execute(
                                "UPDATE agent_status \
                                    SET messages_pending = MAX(messages_pending - 1, 0) \
                                  WHERE agent_id = ?",
                                [&recipient],
                            )?;
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        let changed = tx.execute(
                            "UPDATE broadcast_deliveries \
                                SET status = 'acknowledged', updated_at = ? \
                              WHERE message_id = ? AND agent_id = ? AND status = 'delivered'",
                            params![now, message_id, agent_id],
                        )?;
                        changed == 1
                    }
                };

                if claimed {
                    audit::record(
                        tx,
                        &agent_id,
                        AuditKind::MessageClaim,
                        &format!("claimed {}", message_id),
                    )?;
                }
                debug!(message_id = %message_id, agent_id = %agent_id, claimed, "claim attempt");
                Ok(Ok(claimed))
            });
            outcome?
        })
    }

    /// Completes a claimed direct message as `done` (no error) or `failed`.
    ///
    /// A failure with `delivery_count >= 3` moves the full envelope to the
    /// dead-letter archive and removes the message row. Completing a
    /// broadcast is a no-op: its row lives until TTL and per-recipient state
    /// is carried by the delivery rows.
    ///
    /// # Errors
    /// * `NotFound` if no such message exists
    /// * `InvalidMessage` if the message was never claimed
    pub fn complete(&self, message_id: &str, error: Option<&str>) -> Result<()> {
        let message_id = message_id.to_string();
        let error = error.map(str::to_string);

        self.guarded("broker.complete", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let msg = tx
                    .query_row(
                        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"),
                        [&message_id],
                        message_from_row,
                    )
                    .optional()?;
                let Some(msg) = msg else {
                    return Ok(Err(BrokerError::NotFound(message_id.clone())));
                };
                if msg.is_broadcast() {
                    debug!(message_id = %message_id, "complete on broadcast is a no-op");
                    return Ok(Ok(()));
                }
                if msg.status != MessageStatus::Processing {
                    return Ok(Err(BrokerError::InvalidMessage(format!(
                        "cannot complete {} message {}",
                        msg.status.as_str(),
                        message_id
                    ))));
                }

                let failed = error.is_some();
                if failed && msg.delivery_count >= 3 {
                    let envelope = serde_json::to_string(&msg)?;
                    tx.execute(
                        "INSERT INTO dead_letter (id, message_id, envelope, error, retry_count, moved_at) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                        params![
                            clock::new_id(),
                            msg.id,
                            envelope,
                            error.as_deref().unwrap_or_default(),
                            msg.delivery_count as i64,
                            clock::now_iso(),
                        ],
                    )?;
                    tx.execute("DELETE FROM messages WHERE id = ?", [&msg.id])?;
                    warn!(message_id = %msg.id, delivery_count = msg.delivery_count, "message dead-lettered");
                } else {
                    tx.execute(
                        "UPDATE messages SET status = ?, error = ? WHERE id = ?",
                        params![
                            if failed { "failed" } else { "done" },
                            error,
                            msg.id
                        ],
                    )?;
                }

                let processor = msg.to_agent.clone().unwrap_or_default();
                tx.execute(
                    "UPDATE agent_status \
                        SET messages_processed = messages_processed + 1, \
                            error_count = error_count + ? \
                      WHERE agent_id = ?",
                    params![i64::from(failed), processor],
                )?;
                audit::record(
                    tx,
                    &processor,
                    AuditKind::MessageComplete,
                    &format!(
                        "{} {}",
                        if failed { "failed" } else { "done" },
                        msg.id
                    ),
                )?;
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Marks the caller's delivery row for a broadcast as `skipped`.
    ///
    /// Returns `false` if the row was already acknowledged or skipped.
    pub fn dismiss(&self, agent_id: &str, message_id: &str) -> Result<bool> {
        let agent_id = agent_id.to_string();
        let message_id = message_id.to_string();

        self.guarded("broker.dismiss", |db| {
            let outcome: StorageResult<Result<bool>> = db.immediate(|tx| {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ? AND to_agent IS NULL)",
                    [&message_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(Err(BrokerError::NotFound(message_id.clone())));
                }
                let changed = tx.execute(
                    "UPDATE broadcast_deliveries \
                        SET status = 'skipped', updated_at = ? \
                      WHERE message_id = ? AND agent_id = ? AND status = 'delivered'",
                    params![clock::now_iso(), message_id, agent_id],
                )?;
                if changed == 1 {
                    audit::record(
                        tx,
                        &agent_id,
                        AuditKind::MessageDismiss,
                        &format!("dismissed {}", message_id),
                    )?;
                }
                Ok(Ok(changed == 1))
            });
            outcome?
        })
    }

    /// Replies to a claimed request message and completes it.
    ///
    /// The reply carries the inbound correlation id, swaps sender and
    /// recipient, and keeps channel and priority; its type is the inbound
    /// type with the last segment replaced by `response`.
    ///
    /// # Errors
    /// * `InvalidMessage` if the inbound message has no correlation id or
    ///   is a broadcast
    pub fn reply(&self, inbound: &Message, payload: Value) -> Result<String> {
        self.reply_with_artifact(inbound, payload, None)
    }

    /// Like [`reply`](Self::reply), attaching a reference to an out-of-band
    /// artifact as `artifact_path` in the response payload.
    pub fn reply_with_artifact(
        &self,
        inbound: &Message,
        payload: Value,
        artifact_path: Option<&str>,
    ) -> Result<String> {
        let Some(correlation_id) = inbound.correlation_id.clone() else {
            return Err(BrokerError::InvalidMessage(
                "cannot reply: inbound message has no correlation id".to_string(),
            ));
        };
        let Some(responder) = inbound.to_agent.clone() else {
            return Err(BrokerError::InvalidMessage(
                "cannot reply to a broadcast".to_string(),
            ));
        };

        let mut payload = payload;
        if let Some(path) = artifact_path {
            let obj = payload.as_object_mut().ok_or_else(|| {
                BrokerError::InvalidMessage("payload must be a JSON object".to_string())
            })?;
            obj.insert("artifact_path".to_string(), Value::String(path.to_string()));
        }

        let submit = Submit {
            from_agent: responder,
            to_agent: Some(inbound.from_agent.clone()),
            kind: inbound.kind.response_kind(),
            payload,
            channel: inbound.channel.clone(),
            priority: inbound.priority,
            correlation_id: Some(correlation_id),
            ttl_secs: None,
        };
        let response_id = self.submit_as(submit, AuditKind::MessageReply)?;
        self.complete(&inbound.id, None)?;
        Ok(response_id)
    }

    /// Submits a request and polls for its correlated response.
    ///
    /// Polling backs off exponentially from 50 ms, capped at 500 ms. On a
    /// match the response is claimed, completed, and its payload returned.
    /// The request stays in flight past the deadline; a late response is
    /// garbage-collected at TTL.
    ///
    /// # Errors
    /// * `Timeout` if no response arrives within `timeout`
    pub fn ask(
        &self,
        agent_id: &str,
        to_agent: &str,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let correlation_id = clock::new_id();
        let submit = Submit::direct(agent_id, to_agent, kind, payload)
            .with_correlation_id(correlation_id.clone());
        self.submit(submit)?;

        let started = Instant::now();
        let mut backoff = Duration::from_millis(50);
        loop {
            if let Some(response) = self.find_response(agent_id, &correlation_id)? {
                if self.claim(agent_id, &response.id)? {
                    self.complete(&response.id, None)?;
                    return Ok(response.payload);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(BrokerError::Timeout { waited_ms: elapsed.as_millis() as u64 });
            }
            std::thread::sleep(backoff.min(timeout - elapsed));
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    /// Looks up a message by id, regardless of status.
    pub fn get(&self, message_id: &str) -> Result<Message> {
        let db = storage::lock(&self.db)?;
        let msg = db
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"),
                [message_id],
                message_from_row,
            )
            .optional()?;
        msg.ok_or_else(|| BrokerError::NotFound(message_id.to_string()))
    }

    fn find_response(&self, agent_id: &str, correlation_id: &str) -> Result<Option<Message>> {
        let db = storage::lock(&self.db)?;
        let msg = db
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                      WHERE status = 'pending' AND to_agent = ? AND correlation_id = ? \
                        AND kind LIKE '%response' \
                      LIMIT 1"
                ),
                params![agent_id, correlation_id],
                message_from_row,
            )
            .optional()?;
        Ok(msg)
    }
}
