//! Task types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model_store::is_plain_reference;

/// Upper bound for an adapter weight.
pub const MAX_ADAPTER_WEIGHT: f32 = 2.0;

/// Lifecycle status of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal tasks are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An adapter (LoRA) applied on top of the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Model reference of the adapter artifact.
    pub model: String,
    /// Blend weight, 0.0..=2.0.
    pub weight: f32,
}

impl AdapterSpec {
    pub fn new(model: impl Into<String>, weight: f32) -> Self {
        Self {
            model: model.into(),
            weight,
        }
    }
}

/// How a task's adapters combine with the ones already attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    /// The requested list becomes the whole adapter set.
    #[default]
    Replace,
    /// Requested adapters are merged into the current set.
    Append,
}

impl AdapterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterMode::Replace => "replace",
            AdapterMode::Append => "append",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replace" => Some(AdapterMode::Replace),
            "append" => Some(AdapterMode::Append),
            _ => None,
        }
    }
}

/// What a client asks for when submitting a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub checkpoint: String,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default)]
    pub adapter_mode: AdapterMode,
    /// Opaque payload handed to the generator.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(checkpoint: impl Into<String>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            adapters: Vec::new(),
            adapter_mode: AdapterMode::Replace,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_adapter(mut self, model: impl Into<String>, weight: f32) -> Self {
        self.adapters.push(AdapterSpec::new(model, weight));
        self
    }

    pub fn with_mode(mut self, mode: AdapterMode) -> Self {
        self.adapter_mode = mode;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Check the request is well formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint.trim().is_empty() {
            return Err("checkpoint reference cannot be empty".to_string());
        }
        if !is_plain_reference(&self.checkpoint) {
            return Err(format!(
                "checkpoint reference {:?} must be a plain file name",
                self.checkpoint
            ));
        }
        for (i, adapter) in self.adapters.iter().enumerate() {
            if adapter.model.trim().is_empty() {
                return Err(format!("adapter #{} has an empty model reference", i));
            }
            if !is_plain_reference(&adapter.model) {
                return Err(format!(
                    "adapter reference {:?} must be a plain file name",
                    adapter.model
                ));
            }
            if !adapter.weight.is_finite()
                || adapter.weight < 0.0
                || adapter.weight > MAX_ADAPTER_WEIGHT
            {
                return Err(format!(
                    "adapter {} weight {} is outside 0..={}",
                    adapter.model, adapter.weight, MAX_ADAPTER_WEIGHT
                ));
            }
            if self.adapters[..i].iter().any(|a| a.model == adapter.model) {
                return Err(format!("adapter {} is listed twice", adapter.model));
            }
        }
        Ok(())
    }
}

/// A unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub checkpoint: String,
    pub adapters: Vec<AdapterSpec>,
    pub adapter_mode: AdapterMode,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Moves forward on every promotion. Unix epoch until first promoted.
    pub promoted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh pending task from a request.
    pub fn from_request(request: GenerationRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            checkpoint: request.checkpoint,
            adapters: request.adapters,
            adapter_mode: request.adapter_mode,
            params: request.params,
            result: None,
            error: None,
            created_at,
            // DateTime<Utc>::default() is the Unix epoch
            promoted_at: DateTime::<Utc>::default(),
            started_at: None,
            completed_at: None,
        }
    }
}
