//! Database schema for the coordination store.

use rusqlite::Connection;

use crate::storage::error::StorageResult;

/// Initializes the coordination database schema.
///
/// Creates tables for messages, broadcast delivery tracking, channel
/// subscriptions, agent status, the job board, votes, the dead-letter
/// archive, and the audit log. Idempotent.
///
/// # Errors
/// Returns an error if schema creation fails.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            version TEXT NOT NULL DEFAULT '1.0',
            correlation_id TEXT,
            from_agent TEXT NOT NULL,
            to_agent TEXT,
            channel TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 5,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            expires_at TEXT,
            delivery_count INTEGER NOT NULL DEFAULT 0,
            last_delivered_at TEXT,
            error TEXT
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ready_messages
         ON messages(channel, status, priority DESC, created_at)
         WHERE status = 'pending'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_correlation
         ON messages(correlation_id)
         WHERE correlation_id IS NOT NULL",
        [],
    )?;

    // At most one response per request.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_correlation_response
         ON messages(correlation_id)
         WHERE correlation_id IS NOT NULL AND kind LIKE '%.response'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expiration
         ON messages(expires_at)
         WHERE expires_at IS NOT NULL",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS broadcast_deliveries (
            message_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'delivered',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (message_id, agent_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_deliveries_agent
         ON broadcast_deliveries(agent_id, status)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS channel_subscriptions (
            channel_name TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            subscribed_at TEXT NOT NULL,
            PRIMARY KEY (channel_name, agent_id)
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_agent_channels
         ON channel_subscriptions(agent_id)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS agent_status (
            agent_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            current_task TEXT,
            last_heartbeat TEXT NOT NULL,
            messages_pending INTEGER NOT NULL DEFAULT 0,
            messages_processed INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 5,
            status TEXT NOT NULL DEFAULT 'open',
            assigned_to TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            dependencies TEXT NOT NULL DEFAULT '[]',
            result TEXT,
            error TEXT,
            history TEXT NOT NULL DEFAULT '[]'
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_open_tasks
         ON tasks(status, priority DESC, created_at)
         WHERE status = 'open'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_status
         ON tasks(task_id, status)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            vote_id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            description TEXT,
            options TEXT NOT NULL,
            mechanism TEXT NOT NULL,
            proposed_by TEXT NOT NULL,
            proposed_at TEXT NOT NULL,
            deadline TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            eligible_voters TEXT NOT NULL,
            weights TEXT,
            votes_cast TEXT NOT NULL DEFAULT '{}',
            result TEXT,
            closed_at TEXT
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_open_votes
         ON votes(status, proposed_at)
         WHERE status = 'open'",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            envelope TEXT NOT NULL,
            error TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            moved_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            at TEXT NOT NULL,
            actor TEXT NOT NULL,
            kind TEXT NOT NULL,
            summary TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit(actor)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit(kind)", [])?;

    Ok(())
}
