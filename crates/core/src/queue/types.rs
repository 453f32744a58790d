//! Queue types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a queue operation on a single task was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("not found")]
    NotFound,

    #[error("task already running, cannot cancel")]
    AlreadyRunning,

    #[error("task is running, cannot promote")]
    RunningNotPromotable,

    #[error("another task is already running")]
    Busy,
}

/// A pending task as seen by queue observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTaskView {
    pub id: String,
    /// 0-based; position 0 runs next.
    pub position: usize,
    pub checkpoint: String,
    pub promoted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
