//! Database connection management.
//!
//! Wraps a single SQLite connection configured for concurrent use: WAL
//! journaling, relaxed synchronous mode, and a busy timeout so readers
//! and writers in other processes do not fail immediately. Mutating
//! operations go through [`Database::immediate`], which reserves the
//! writer lock up front and retries transient contention with bounded
//! exponential backoff.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::initialize_schema;

/// Shared handle to the coordination database.
///
/// SQLite serializes writers itself; the mutex only keeps the in-process
/// connection single-threaded.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Retry policy for write transactions that hit the writer lock.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up with `Unavailable`.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(50), multiplier: 2.0 }
    }
}

impl RetryPolicy {
    /// Calculates the delay before retry number `attempt` (0-based), with
    /// +/-50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((base * jitter) as u64)
    }
}

/// Database connection wrapper for the coordination store.
pub struct Database {
    conn: Connection,
    retry: RetryPolicy,
}

impl Database {
    /// Opens (and initializes) the database at the given path.
    ///
    /// # Errors
    /// Returns `StorageError::Connection` if the connection or schema
    /// setup fails.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with(path, Duration::from_secs(5), RetryPolicy::default())
    }

    /// Opens the database with an explicit busy timeout and retry policy.
    pub fn open_with(
        path: &Path,
        busy_timeout: Duration,
        retry: RetryPolicy,
    ) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::configure(&conn, busy_timeout)?;
        initialize_schema(&conn)?;
        debug!(path = %path.display(), "coordination store opened");
        Ok(Self { conn, retry })
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn, Duration::from_secs(5))?;
        initialize_schema(&conn)?;
        Ok(Self { conn, retry: RetryPolicy::default() })
    }

    fn configure(conn: &Connection, busy_timeout: Duration) -> StorageResult<()> {
        // journal_mode returns a row; in-memory databases report "memory".
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(())
    }

    /// Gets a reference to the underlying connection for read-only queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs a closure inside an immediate (writer-reserving) transaction.
    ///
    /// The closure may run more than once: transient `SQLITE_BUSY` failures
    /// are retried with exponential backoff and jitter, up to the policy's
    /// attempt budget. Persistent contention surfaces as
    /// `StorageError::Unavailable`.
    ///
    /// # Errors
    /// Any non-busy error from the closure is returned as-is after rollback.
    pub fn immediate<F, R>(&mut self, mut f: F) -> StorageResult<R>
    where
        F: FnMut(&Transaction) -> StorageResult<R>,
    {
        let mut attempt = 0;
        loop {
            match self.try_immediate(&mut f) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "store busy, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) if is_busy(&err) => {
                    return Err(StorageError::Unavailable(format!(
                        "store busy after {} attempts",
                        self.retry.max_attempts
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_immediate<F, R>(&mut self, f: &mut F) -> StorageResult<R>
    where
        F: FnMut(&Transaction) -> StorageResult<R>,
    {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Drop rolls the transaction back; an explicit rollback
                // failure must not mask the original error.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

/// Locks a shared database handle, mapping poisoning to `Unavailable`.
pub fn lock(db: &SharedDatabase) -> StorageResult<std::sync::MutexGuard<'_, Database>> {
    db.lock().map_err(|e| StorageError::Unavailable(format!("database lock poisoned: {}", e)))
}

fn is_busy(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Connection(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
