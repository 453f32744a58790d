//! Task storage trait.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{Task, TaskStatus};

/// Error type for task persistence.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskStoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} task {task_id}: current status is {status}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        operation: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

/// Trait for task storage backends.
///
/// Every transition is conditional on the status it starts from, so a
/// terminal task can never be overwritten.
pub trait TaskStore: Send + Sync {
    /// Persist a newly submitted task.
    fn insert(&self, task: &Task) -> Result<(), TaskStoreError>;

    /// Get a task by ID.
    fn get(&self, id: &str) -> Result<Option<Task>, TaskStoreError>;

    /// List tasks, optionally restricted to one status, oldest first.
    fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskStoreError>;

    /// pending -> running
    fn mark_running(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError>;

    /// running -> completed
    fn mark_completed(
        &self,
        id: &str,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Task, TaskStoreError>;

    /// running -> failed
    fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>)
        -> Result<Task, TaskStoreError>;

    /// pending -> cancelled
    fn mark_cancelled(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError>;

    /// Bump the promotion time of a pending task.
    fn set_promoted_at(&self, id: &str, at: DateTime<Utc>) -> Result<Task, TaskStoreError>;
}
