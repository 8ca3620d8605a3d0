//! Task data structures for the job board.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle status.
///
/// A task is *available* iff it is `Open` and every dependency is `Done`.
/// The assignee is set exactly while the task is `Assigned`, `InProgress`,
/// `Done`, or `Failed`; `Open` and `Blocked` tasks carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Unclaimed and waiting.
    Open,
    /// Claimed, not yet started.
    Assigned,
    /// Being worked on.
    InProgress,
    /// Paused on an external obstacle.
    Blocked,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// String form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TaskStatus::Open),
            "assigned" => Some(TaskStatus::Assigned),
            "in-progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// One entry in a task's history trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the action happened.
    pub at: DateTime<Utc>,
    /// What happened, e.g. `created` or `status: assigned -> in-progress`.
    pub action: String,
    /// Who did it.
    pub by: String,
}

/// A task on the job board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub task_id: String,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Priority 1 (lowest) to 10 (highest).
    pub priority: u8,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Current assignee, if any.
    pub assigned_to: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// When work started (first transition to in-progress).
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached `done` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Task ids that must be `done` before this task is available.
    pub dependencies: Vec<String>,
    /// Result summary recorded on completion.
    pub result: Option<String>,
    /// Error recorded on failure.
    pub error: Option<String>,
    /// Append-only history trail.
    pub history: Vec<HistoryEntry>,
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Explicit task id; generated when `None`.
    pub task_id: Option<String>,
    /// Short title (required).
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Priority 1-10, default 5.
    pub priority: u8,
    /// Task ids this task depends on.
    pub dependencies: Vec<String>,
    /// Creator recorded in the history trail.
    pub created_by: String,
}

impl NewTask {
    /// Starts a task definition with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            task_id: None,
            title: title.into(),
            description: String::new(),
            priority: 5,
            dependencies: Vec::new(),
            created_by: "system".to_string(),
        }
    }

    /// Sets an explicit task id.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Records who created the task.
    pub fn created_by(mut self, agent_id: impl Into<String>) -> Self {
        self.created_by = agent_id.into();
        self
    }
}
