//! Pipeline types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model_store::ModelHandle;
use crate::task::AdapterSpec;

/// Errors raised while reconciling the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("checkpoint {reference} unavailable: {reason}")]
    CheckpointUnavailable { reference: String, reason: String },

    #[error("adapter {reference} unavailable: {reason}")]
    AdapterUnavailable { reference: String, reason: String },

    #[error("pipeline state persistence failed: {0}")]
    Persistence(String),
}

/// Persisted view of the execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Loaded checkpoint reference; `None` when nothing is loaded.
    pub checkpoint: Option<String>,
    /// Attached adapters, in attach order.
    pub adapters: Vec<AdapterSpec>,
    /// Task the pipeline was last reconciled for.
    pub last_task_id: Option<String>,
}

/// An attached adapter with its resolved artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedAdapter {
    pub spec: AdapterSpec,
    pub handle: ModelHandle,
}

/// What the generator runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHandle {
    pub checkpoint: ModelHandle,
    pub adapters: Vec<LoadedAdapter>,
}

/// What an `ensure` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureReport {
    pub checkpoint_reloaded: bool,
    /// Adapters freshly loaded.
    pub loaded: Vec<String>,
    /// Adapters kept but with a new weight.
    pub reweighted: Vec<String>,
    /// Adapters left exactly as they were.
    pub untouched: Vec<String>,
}

impl EnsureReport {
    /// True when the pipeline did not change at all.
    pub fn is_noop(&self) -> bool {
        !self.checkpoint_reloaded && self.loaded.is_empty() && self.reweighted.is_empty()
    }
}

/// Storage for the single pipeline state record.
pub trait PipelineStateStore: Send + Sync {
    fn load(&self) -> Result<Option<PipelineState>, PipelineError>;

    fn save(&self, state: &PipelineState) -> Result<(), PipelineError>;
}
