//! Types for model store operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving or loading a model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelStoreError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Model {reference} is unusable: {reason}")]
    Corrupt { reference: String, reason: String },

    #[error("Invalid model reference: {0:?}")]
    InvalidReference(String),

    #[error("Model store I/O error: {0}")]
    Io(String),
}

/// Whether `reference` names a single file stem inside the store: no path
/// separators, no parent or current directory components, not absolute.
pub fn is_plain_reference(reference: &str) -> bool {
    !reference.is_empty()
        && reference != "."
        && reference != ".."
        && !reference.contains(['/', '\\', '\0'])
        && !std::path::Path::new(reference).is_absolute()
}

/// A loaded model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Content hash (upper-case SHA-256) of the artifact.
    pub reference: String,
    /// Location of the artifact on disk.
    pub path: PathBuf,
    /// Artifact size in bytes.
    pub size_bytes: u64,
}

/// Metadata recorded when a downloaded artifact joins the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredArtifact {
    pub reference: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_kind: Option<String>,
    pub source_url: String,
}

/// Trait for content-addressed model storage.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Whether an artifact with this reference is present.
    async fn exists(&self, reference: &str) -> Result<bool, ModelStoreError>;

    /// Resolve and open an artifact.
    async fn load(&self, reference: &str) -> Result<ModelHandle, ModelStoreError>;

    /// Record a freshly downloaded artifact.
    async fn register(&self, artifact: &RegisteredArtifact) -> Result<(), ModelStoreError>;
}
