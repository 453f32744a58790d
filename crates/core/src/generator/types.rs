//! Generator trait and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pipeline::PipelineHandle;

/// Errors from the generation operation. All of them are terminal for the
/// task that raised them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid generation response: {0}")]
    InvalidResponse(String),
}

/// Progress of a running generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationProgress {
    /// 0.0..=1.0
    pub fraction: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

impl GenerationProgress {
    /// Progress from a step counter.
    pub fn from_steps(step: u32, total_steps: u32) -> Self {
        let fraction = if total_steps == 0 {
            0.0
        } else {
            (step as f32 / total_steps as f32).clamp(0.0, 1.0)
        };
        Self {
            fraction,
            step: Some(step),
            total_steps: Some(total_steps),
        }
    }
}

/// Runs one generation against the loaded pipeline.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Execute with the given opaque parameters and return the result.
    ///
    /// Progress updates are optional. If the receiver is gone the
    /// generation continues without reporting.
    async fn execute(
        &self,
        pipeline: &PipelineHandle,
        params: &serde_json::Value,
        progress_tx: mpsc::Sender<GenerationProgress>,
    ) -> Result<serde_json::Value, GenerationError>;
}
