//! Types for the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchFailure;
use crate::queue::QueuedTaskView;
use crate::task::TaskStoreError;

/// Errors surfaced to scheduler callers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed request; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Task store failure.
    #[error("task store error: {0}")]
    Store(#[from] TaskStoreError),
}

/// Returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub id: String,
    /// 0-based queue position at the time of submission.
    pub position: usize,
}

/// Per-id outcome of a batch cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// Per-id outcome of a batch promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteOutcome {
    pub updated: Vec<String>,
    /// New 0-based positions of the promoted tasks, in request order.
    pub new_positions: Vec<TaskPosition>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPosition {
    pub id: String,
    pub position: usize,
}

/// The task currently on the GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningTaskView {
    pub id: String,
    pub checkpoint: String,
    pub started_at: DateTime<Utc>,
    /// 0.0..=1.0 when the generator reports progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    /// Estimated seconds left, once at least one task has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

/// State of the generation queue as pushed to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub running: Option<RunningTaskView>,
    /// Checkpoint currently loaded in the pipeline.
    pub active_checkpoint: Option<String>,
    /// Pending tasks in execution order.
    pub pending: Vec<QueuedTaskView>,
    /// Number of pending tasks.
    pub queue_length: usize,
}
