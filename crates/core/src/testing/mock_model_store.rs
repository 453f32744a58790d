//! Mock model store for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model_store::{ModelHandle, ModelStore, ModelStoreError, RegisteredArtifact};

/// Mock implementation of the ModelStore trait.
///
/// Provides controllable behavior for testing:
/// - Declare which references exist
/// - Mark references as corrupt so `load` fails
/// - Record every `load` and `register` call
///
/// # Example
///
/// ```rust,ignore
/// use sdhost_core::testing::MockModelStore;
///
/// let models = MockModelStore::new();
/// models.add_model("A").await;
///
/// // ... run the pipeline ...
///
/// assert_eq!(models.load_count("A").await, 1);
/// ```
#[derive(Debug)]
pub struct MockModelStore {
    /// Known references and their sizes.
    models: Arc<RwLock<HashMap<String, u64>>>,
    /// References whose load fails as corrupt.
    corrupt: Arc<RwLock<HashSet<String>>>,
    /// Every reference passed to `load`, in call order.
    loads: Arc<RwLock<Vec<String>>>,
    /// Every registered artifact.
    registered: Arc<RwLock<Vec<RegisteredArtifact>>>,
}

impl Default for MockModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModelStore {
    /// Create an empty mock store.
    pub fn new() -> Self {
        Self {
            models: Arc::new(RwLock::new(HashMap::new())),
            corrupt: Arc::new(RwLock::new(HashSet::new())),
            loads: Arc::new(RwLock::new(Vec::new())),
            registered: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create a store that already holds the given references.
    pub async fn with_models(references: &[&str]) -> Self {
        let store = Self::new();
        for reference in references {
            store.add_model(reference).await;
        }
        store
    }

    /// Make a reference available.
    pub async fn add_model(&self, reference: &str) {
        self.models
            .write()
            .await
            .insert(reference.to_string(), 1024 * 1024);
    }

    /// Make a reference unavailable.
    pub async fn remove_model(&self, reference: &str) {
        self.models.write().await.remove(reference);
    }

    /// Make loads of a reference fail as corrupt.
    pub async fn mark_corrupt(&self, reference: &str) {
        self.corrupt.write().await.insert(reference.to_string());
    }

    /// All references passed to `load`, in order.
    pub async fn recorded_loads(&self) -> Vec<String> {
        self.loads.read().await.clone()
    }

    /// How many times a reference was loaded.
    pub async fn load_count(&self, reference: &str) -> usize {
        self.loads
            .read()
            .await
            .iter()
            .filter(|r| r.as_str() == reference)
            .count()
    }

    /// Clear recorded loads.
    pub async fn clear_recorded_loads(&self) {
        self.loads.write().await.clear();
    }

    /// All registered artifacts.
    pub async fn registered(&self) -> Vec<RegisteredArtifact> {
        self.registered.read().await.clone()
    }
}

#[async_trait]
impl ModelStore for MockModelStore {
    async fn exists(&self, reference: &str) -> Result<bool, ModelStoreError> {
        Ok(self.models.read().await.contains_key(reference))
    }

    async fn load(&self, reference: &str) -> Result<ModelHandle, ModelStoreError> {
        self.loads.write().await.push(reference.to_string());

        let size_bytes = *self
            .models
            .read()
            .await
            .get(reference)
            .ok_or_else(|| ModelStoreError::NotFound(reference.to_string()))?;

        if self.corrupt.read().await.contains(reference) {
            return Err(ModelStoreError::Corrupt {
                reference: reference.to_string(),
                reason: "mock corruption".to_string(),
            });
        }

        Ok(ModelHandle {
            reference: reference.to_string(),
            path: PathBuf::from(format!("/mock/models/{}.safetensors", reference)),
            size_bytes,
        })
    }

    async fn register(&self, artifact: &RegisteredArtifact) -> Result<(), ModelStoreError> {
        self.models
            .write()
            .await
            .insert(artifact.reference.clone(), artifact.size_bytes);
        self.registered.write().await.push(artifact.clone());
        Ok(())
    }
}
