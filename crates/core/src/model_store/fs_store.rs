//! Filesystem-backed model store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{is_plain_reference, ModelHandle, ModelStore, ModelStoreError, RegisteredArtifact};

/// Model store laid out as `<dir>/<SHA256><ext>` with a `<SHA256>.json`
/// sidecar for registered metadata.
pub struct FsModelStore {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl FsModelStore {
    /// Create a store over `dir`, recognizing the given file extensions
    /// (with leading dot, e.g. `.safetensors`).
    pub fn new(dir: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            extensions,
        }
    }

    /// Directory holding the artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the metadata sidecar for a reference.
    pub fn sidecar_path(&self, reference: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", reference.to_ascii_uppercase()))
    }

    /// Find the artifact file for a reference, if any.
    async fn locate(&self, reference: &str) -> Result<Option<PathBuf>, ModelStoreError> {
        if !is_plain_reference(reference) {
            return Err(ModelStoreError::InvalidReference(reference.to_string()));
        }

        let mut stems = vec![
            reference.to_string(),
            reference.to_ascii_uppercase(),
            reference.to_ascii_lowercase(),
        ];
        stems.dedup();

        for stem in &stems {
            for ext in &self.extensions {
                let candidate = self.dir.join(format!("{}{}", stem, ext));
                match tokio::fs::metadata(&candidate).await {
                    Ok(meta) if meta.is_file() => return Ok(Some(candidate)),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(ModelStoreError::Io(e.to_string())),
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn exists(&self, reference: &str) -> Result<bool, ModelStoreError> {
        Ok(self.locate(reference).await?.is_some())
    }

    async fn load(&self, reference: &str) -> Result<ModelHandle, ModelStoreError> {
        let path = self
            .locate(reference)
            .await?
            .ok_or_else(|| ModelStoreError::NotFound(reference.to_string()))?;

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ModelStoreError::Io(e.to_string()))?;
        if meta.len() == 0 {
            return Err(ModelStoreError::Corrupt {
                reference: reference.to_string(),
                reason: "artifact file is empty".to_string(),
            });
        }

        debug!(reference, path = %path.display(), "Resolved model artifact");
        Ok(ModelHandle {
            reference: reference.to_ascii_uppercase(),
            path,
            size_bytes: meta.len(),
        })
    }

    async fn register(&self, artifact: &RegisteredArtifact) -> Result<(), ModelStoreError> {
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| ModelStoreError::Io(e.to_string()))?;
        tokio::fs::write(self.sidecar_path(&artifact.reference), json)
            .await
            .map_err(|e| ModelStoreError::Io(e.to_string()))?;

        info!(
            reference = %artifact.reference,
            path = %artifact.path.display(),
            "Registered model artifact"
        );
        Ok(())
    }
}
