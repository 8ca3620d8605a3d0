//! Transactional job board.
//!
//! Tasks are claimed with the same check-then-write discipline as messages:
//! an immediate transaction re-reads the row and only an `open` task with
//! satisfied dependencies transitions to `assigned`. Completing a task
//! releases dependents implicitly; they simply become visible in the next
//! availability scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditKind};
use crate::clock;
use crate::jobs::error::{Result, TaskError};
use crate::jobs::task::{HistoryEntry, NewTask, Task, TaskStatus};
use crate::limits::CircuitBreaker;
use crate::storage::{self, Database, SharedDatabase, StorageResult};

const TASK_COLUMNS: &str = "task_id, title, description, priority, status, assigned_to, \
     created_at, updated_at, started_at, completed_at, dependencies, result, error, history";

fn text_conversion(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let started_at: Option<String> = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    let dependencies: String = row.get(10)?;
    let history: String = row.get(13)?;

    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        priority: row.get::<_, i64>(3)? as u8,
        status: TaskStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
        })?,
        assigned_to: row.get(5)?,
        created_at: clock::from_iso(&created_at).map_err(|e| text_conversion(6, e))?,
        updated_at: clock::from_iso(&updated_at).map_err(|e| text_conversion(7, e))?,
        started_at: started_at
            .map(|s| clock::from_iso(&s).map_err(|e| text_conversion(8, e)))
            .transpose()?,
        completed_at: completed_at
            .map(|s| clock::from_iso(&s).map_err(|e| text_conversion(9, e)))
            .transpose()?,
        dependencies: serde_json::from_str(&dependencies).map_err(|e| text_conversion(10, e))?,
        result: row.get(11)?,
        error: row.get(12)?,
        history: serde_json::from_str(&history).map_err(|e| text_conversion(13, e))?,
    })
}

fn history_entry(action: impl Into<String>, by: &str) -> HistoryEntry {
    HistoryEntry { at: clock::now(), action: action.into(), by: by.to_string() }
}

/// Job board over the shared store.
#[derive(Clone)]
pub struct JobBoard {
    db: SharedDatabase,
    breaker: Arc<CircuitBreaker>,
}

impl JobBoard {
    /// Creates a job board over the shared database.
    pub fn new(db: SharedDatabase, breaker: Arc<CircuitBreaker>) -> Self {
        Self { db, breaker }
    }

    fn guarded<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        if !self.breaker.check(operation) {
            return Err(TaskError::CircuitOpen { operation: operation.to_string() });
        }
        let result = {
            let mut db = storage::lock(&self.db)?;
            f(&mut db)
        };
        match &result {
            Ok(_) => self.breaker.record_success(operation),
            Err(TaskError::Storage(_)) => self.breaker.record_failure(operation),
            Err(_) => {}
        }
        result
    }

    /// Creates a task with status `open` and a `created` history entry.
    ///
    /// # Errors
    /// * `InvalidTask` on an empty title, out-of-range priority,
    ///   self-dependency, or duplicate task id
    pub fn create(&self, new: NewTask) -> Result<String> {
        if new.title.trim().is_empty() {
            return Err(TaskError::InvalidTask("title must not be empty".to_string()));
        }
        if !(1..=10).contains(&new.priority) {
            return Err(TaskError::InvalidTask(format!(
                "priority must be 1-10, got {}",
                new.priority
            )));
        }
        let task_id = new.task_id.clone().unwrap_or_else(|| clock::new_short_id("task"));
        if new.dependencies.iter().any(|dep| dep == &task_id) {
            return Err(TaskError::InvalidTask(format!(
                "task {} cannot depend on itself",
                task_id
            )));
        }

        self.guarded("jobs.create", |db| {
            let outcome: StorageResult<Result<String>> = db.immediate(|tx| {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE task_id = ?)",
                    [&task_id],
                    |row| row.get(0),
                )?;
                if exists {
                    return Ok(Err(TaskError::InvalidTask(format!(
                        "task id {} already exists",
                        task_id
                    ))));
                }

                let now = clock::now_iso();
                let history = vec![history_entry("created", &new.created_by)];
                tx.execute(
                    "INSERT INTO tasks (task_id, title, description, priority, status, \
                     created_at, updated_at, dependencies, history) \
                     VALUES (?, ?, ?, ?, 'open', ?, ?, ?, ?)",
                    params![
                        task_id,
                        new.title,
                        new.description,
                        new.priority as i64,
                        now,
                        now,
                        serde_json::to_string(&new.dependencies)?,
                        serde_json::to_string(&history)?,
                    ],
                )?;
                audit::record(tx, &new.created_by, AuditKind::TaskCreate, &task_id)?;
                debug!(task_id = %task_id, priority = new.priority, "task created");
                Ok(Ok(task_id.clone()))
            });
            outcome?
        })
    }

    /// Returns available tasks: `open` with every dependency `done`, sorted
    /// by priority descending then creation time ascending. With an agent
    /// filter, tasks assigned to other agents are excluded.
    pub fn available(&self, agent_id: Option<&str>) -> Result<Vec<Task>> {
        let db = storage::lock(&self.db)?;

        let mut stmt = db.conn().prepare("SELECT task_id, status FROM tasks")?;
        let statuses: HashMap<String, String> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;

        let mut stmt = db.conn().prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'open' \
             ORDER BY priority DESC, created_at ASC"
        ))?;
        let open = stmt
            .query_map([], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(open
            .into_iter()
            .filter(|task| {
                if let (Some(agent), Some(assignee)) = (agent_id, task.assigned_to.as_deref()) {
                    if assignee != agent {
                        return false;
                    }
                }
                task.dependencies
                    .iter()
                    .all(|dep| statuses.get(dep).map(String::as_str) == Some("done"))
            })
            .collect())
    }

    /// Atomically claims an open task for `agent_id`.
    ///
    /// # Errors
    /// * `NotFound` if the task does not exist
    /// * `AlreadyClaimed` if it is no longer open
    /// * `DependenciesUnmet` listing the dependencies not yet done
    pub fn claim(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();

        self.guarded("jobs.claim", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let task = load_task(tx, &task_id)?;
                let Some(mut task) = task else {
                    return Ok(Err(TaskError::NotFound(task_id.clone())));
                };
                if task.status != TaskStatus::Open {
                    return Ok(Err(TaskError::AlreadyClaimed {
                        task_id: task_id.clone(),
                        assignee: task.assigned_to,
                    }));
                }
                let unmet = unmet_dependencies(tx, &task.dependencies)?;
                if !unmet.is_empty() {
                    return Ok(Err(TaskError::DependenciesUnmet(unmet)));
                }

                task.history.push(history_entry("claimed", &agent_id));
                let changed = tx.execute(
                    "UPDATE tasks SET status = 'assigned', assigned_to = ?, updated_at = ?, \
                     history = ? WHERE task_id = ? AND status = 'open'",
                    params![
                        agent_id,
                        clock::now_iso(),
                        serde_json::to_string(&task.history)?,
                        task_id
                    ],
                )?;
                if changed != 1 {
                    return Ok(Err(TaskError::AlreadyClaimed {
                        task_id: task_id.clone(),
                        assignee: None,
                    }));
                }
                audit::record(tx, &agent_id, AuditKind::TaskClaim, &task_id)?;
                debug!(task_id = %task_id, agent_id = %agent_id, "task claimed");
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Applies a permitted status transition:
    /// `assigned -> in-progress`, `in-progress -> blocked`, or
    /// `blocked -> in-progress` (which re-assigns the task to `by`).
    ///
    /// # Errors
    /// * `InvalidTransition` for anything else
    pub fn update(&self, task_id: &str, new_status: TaskStatus, by: &str) -> Result<()> {
        let task_id = task_id.to_string();
        let by = by.to_string();

        self.guarded("jobs.update", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let Some(mut task) = load_task(tx, &task_id)? else {
                    return Ok(Err(TaskError::NotFound(task_id.clone())));
                };

                let now = clock::now_iso();
                let permitted = matches!(
                    (task.status, new_status),
                    (TaskStatus::Assigned, TaskStatus::InProgress)
                        | (TaskStatus::InProgress, TaskStatus::Blocked)
                        | (TaskStatus::Blocked, TaskStatus::InProgress)
                );
                if !permitted {
                    return Ok(Err(TaskError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: new_status.as_str().to_string(),
                    }));
                }

                task.history.push(history_entry(
                    format!("status: {} -> {}", task.status.as_str(), new_status.as_str()),
                    &by,
                ));

                // Blocked tasks carry no assignee; resuming re-assigns to the
                // caller. Hidden from availability either way.
                let assignee: Option<&str> = match new_status {
                    TaskStatus::Blocked => None,
                    _ => Some(&by),
                };
                let started_at = match (new_status, task.started_at) {
                    (TaskStatus::InProgress, None) => Some(now.clone()),
                    (_, existing) => existing.map(clock::to_iso),
                };
                tx.execute(
                    "UPDATE tasks SET status = ?, assigned_to = ?, started_at = ?, \
                     updated_at = ?, history = ? WHERE task_id = ?",
                    params![
                        new_status.as_str(),
                        assignee,
                        started_at,
                        now,
                        serde_json::to_string(&task.history)?,
                        task_id
                    ],
                )?;
                audit::record(
                    tx,
                    &by,
                    AuditKind::TaskUpdate,
                    &format!("{} -> {}", task_id, new_status.as_str()),
                )?;
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Completes a claimed task with a result summary. Dependents become
    /// visible in the next availability scan; no push is performed.
    pub fn complete(&self, task_id: &str, result: &str) -> Result<()> {
        self.finish(task_id, Ok(result))
    }

    /// Fails a claimed task with an error.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        self.finish(task_id, Err(error))
    }

    fn finish(&self, task_id: &str, outcome: std::result::Result<&str, &str>) -> Result<()> {
        let task_id = task_id.to_string();
        let (new_status, result, error) = match outcome {
            Ok(summary) => (TaskStatus::Done, Some(summary.to_string()), None),
            Err(err) => (TaskStatus::Failed, None, Some(err.to_string())),
        };

        self.guarded("jobs.complete", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let Some(mut task) = load_task(tx, &task_id)? else {
                    return Ok(Err(TaskError::NotFound(task_id.clone())));
                };
                // Claimed tasks may finish without an explicit in-progress
                // update; everything else must not jump to a terminal state.
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return Ok(Err(TaskError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: new_status.as_str().to_string(),
                    }));
                }

                let actor = task.assigned_to.clone().unwrap_or_else(|| "system".to_string());
                task.history.push(history_entry(
                    format!("status: {} -> {}", task.status.as_str(), new_status.as_str()),
                    &actor,
                ));
                let now = clock::now_iso();
                tx.execute(
                    "UPDATE tasks SET status = ?, result = ?, error = ?, completed_at = ?, \
                     updated_at = ?, history = ? WHERE task_id = ?",
                    params![
                        new_status.as_str(),
                        result,
                        error,
                        now,
                        now,
                        serde_json::to_string(&task.history)?,
                        task_id
                    ],
                )?;
                audit::record(
                    tx,
                    &actor,
                    AuditKind::TaskComplete,
                    &format!("{} {}", task_id, new_status.as_str()),
                )?;
                info!(task_id = %task_id, status = new_status.as_str(), "task finished");
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Scans for tasks stuck in `assigned` or `in-progress` past the
    /// threshold. Read-only; reassignment is an explicit operator call to
    /// [`release`](Self::release).
    pub fn stale(&self, threshold: Duration) -> Result<Vec<Task>> {
        let cutoff = clock::to_iso(
            clock::now()
                - ChronoDuration::seconds(threshold.as_secs().min(i64::MAX as u64) as i64),
        );
        let db = storage::lock(&self.db)?;
        let mut stmt = db.conn().prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
              WHERE status IN ('assigned', 'in-progress') \
                AND COALESCE(started_at, updated_at) < ? \
              ORDER BY priority DESC, created_at ASC"
        ))?;
        let tasks = stmt
            .query_map([&cutoff], task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Returns a stuck task to the board: status back to `open`, assignee
    /// cleared, a history note appended.
    pub fn release(&self, task_id: &str, note: &str) -> Result<()> {
        let task_id = task_id.to_string();
        let note = note.to_string();

        self.guarded("jobs.release", |db| {
            let outcome: StorageResult<Result<()>> = db.immediate(|tx| {
                let Some(mut task) = load_task(tx, &task_id)? else {
                    return Ok(Err(TaskError::NotFound(task_id.clone())));
                };
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return Ok(Err(TaskError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: TaskStatus::Open.as_str().to_string(),
                    }));
                }

                task.history.push(history_entry(format!("released: {}", note), "operator"));
                tx.execute(
                    "UPDATE tasks SET status = 'open', assigned_to = NULL, started_at = NULL, \
                     updated_at = ?, history = ? WHERE task_id = ?",
                    params![clock::now_iso(), serde_json::to_string(&task.history)?, task_id],
                )?;
                audit::record(tx, "operator", AuditKind::TaskRelease, &task_id)?;
                warn!(task_id = %task_id, note = %note, "stale task released");
                Ok(Ok(()))
            });
            outcome?
        })
    }

    /// Looks up a task by id.
    pub fn get(&self, task_id: &str) -> Result<Task> {
        let db = storage::lock(&self.db)?;
        let task = db
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"),
                [task_id],
                task_from_row,
            )
            .optional()?;
        task.ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }
}

fn load_task(tx: &Transaction, task_id: &str) -> StorageResult<Option<Task>> {
    let task = tx
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"),
            [task_id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

fn unmet_dependencies(tx: &Transaction, dependencies: &[String]) -> StorageResult<Vec<String>> {
    let mut unmet = Vec::new();
    for dep in dependencies {
        let status: Option<String> = tx
            .query_row("SELECT status FROM tasks WHERE task_id = ?", [dep], |row| row.get(0))
            .optional()?;
        // An unknown dependency counts as unmet.
        if status.as_deref() != Some("done") {
            unmet.push(dep.clone());
        }
    }
    Ok(unmet)
}
