//! Pipeline reconciliation.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    EnsureReport, LoadedAdapter, PipelineError, PipelineHandle, PipelineState, PipelineStateStore,
};
use crate::metrics;
use crate::model_store::{ModelHandle, ModelStore};
use crate::task::{AdapterMode, AdapterSpec};

/// Read-only view of the pipeline state for other components.
#[derive(Clone)]
pub struct PipelineStatusHandle {
    state: Arc<RwLock<PipelineState>>,
}

impl PipelineStatusHandle {
    /// Current pipeline state.
    pub async fn get(&self) -> PipelineState {
        self.state.read().await.clone()
    }
}

/// Owner of the execution context.
///
/// `ensure` takes `&mut self`: whoever holds the manager is the only
/// writer. Everyone else observes through a [`PipelineStatusHandle`].
pub struct PipelineManager {
    models: Arc<dyn ModelStore>,
    store: Arc<dyn PipelineStateStore>,
    state: PipelineState,
    checkpoint: Option<ModelHandle>,
    adapters: Vec<LoadedAdapter>,
    published: Arc<RwLock<PipelineState>>,
}

impl PipelineManager {
    /// Create a manager with nothing loaded.
    ///
    /// A state persisted by a previous process describes a context that no
    /// longer exists, so it is replaced by the unloaded state.
    pub fn new(models: Arc<dyn ModelStore>, store: Arc<dyn PipelineStateStore>) -> Self {
        match store.load() {
            Ok(Some(previous)) if previous != PipelineState::default() => {
                info!(
                    checkpoint = ?previous.checkpoint,
                    adapters = previous.adapters.len(),
                    "Discarding pipeline state from previous run"
                );
                if let Err(e) = store.save(&PipelineState::default()) {
                    warn!("Failed to reset persisted pipeline state: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read persisted pipeline state: {}", e),
        }

        Self {
            models,
            store,
            state: PipelineState::default(),
            checkpoint: None,
            adapters: Vec::new(),
            published: Arc::new(RwLock::new(PipelineState::default())),
        }
    }

    /// Current state.
    pub fn status(&self) -> PipelineState {
        self.state.clone()
    }

    /// A handle other components can read the state through.
    pub fn status_handle(&self) -> PipelineStatusHandle {
        PipelineStatusHandle {
            state: Arc::clone(&self.published),
        }
    }

    /// What the generator should run against, if a checkpoint is loaded.
    pub fn handle(&self) -> Option<PipelineHandle> {
        self.checkpoint.as_ref().map(|checkpoint| PipelineHandle {
            checkpoint: checkpoint.clone(),
            adapters: self.adapters.clone(),
        })
    }

    /// Bring the pipeline into the configuration a task needs.
    ///
    /// The checkpoint is only loaded when it differs from the current one.
    /// In `Append` mode adapters that already match exactly are kept and
    /// only the difference is applied; in `Replace` mode the requested set
    /// is loaded in full. A checkpoint swap reloads every adapter of the
    /// resulting set. Nothing changes unless every load succeeds.
    pub async fn ensure(
        &mut self,
        task_id: &str,
        checkpoint: &str,
        adapters: &[AdapterSpec],
        mode: AdapterMode,
    ) -> Result<EnsureReport, PipelineError> {
        let mut report = EnsureReport::default();

        let reload = self.state.checkpoint.as_deref() != Some(checkpoint);
        let new_checkpoint = if reload {
            Some(self.load_checkpoint(checkpoint).await?)
        } else {
            None
        };
        report.checkpoint_reloaded = reload;

        let target = match mode {
            AdapterMode::Replace => adapters.to_vec(),
            AdapterMode::Append => {
                let mut merged = self.state.adapters.clone();
                for requested in adapters {
                    match merged.iter_mut().find(|a| a.model == requested.model) {
                        Some(existing) => existing.weight = requested.weight,
                        None => merged.push(requested.clone()),
                    }
                }
                merged
            }
        };

        let keep_attached = !reload && mode == AdapterMode::Append;
        let mut next_adapters = Vec::with_capacity(target.len());
        for spec in target {
            let current = self.adapters.iter().find(|a| a.spec.model == spec.model);
            match current {
                Some(attached) if keep_attached && attached.spec.weight == spec.weight => {
                    report.untouched.push(spec.model.clone());
                    next_adapters.push(attached.clone());
                }
                Some(attached) if keep_attached => {
                    report.reweighted.push(spec.model.clone());
                    next_adapters.push(LoadedAdapter {
                        spec,
                        handle: attached.handle.clone(),
                    });
                }
                _ => {
                    let handle = self.load_adapter(&spec.model).await?;
                    report.loaded.push(spec.model.clone());
                    next_adapters.push(LoadedAdapter { spec, handle });
                }
            }
        }

        let next_state = PipelineState {
            checkpoint: Some(checkpoint.to_string()),
            adapters: next_adapters.iter().map(|a| a.spec.clone()).collect(),
            last_task_id: Some(task_id.to_string()),
        };
        self.store.save(&next_state)?;

        if let Some(handle) = new_checkpoint {
            self.checkpoint = Some(handle);
            metrics::CHECKPOINT_RELOADS.inc();
        }
        self.adapters = next_adapters;
        self.state = next_state;
        *self.published.write().await = self.state.clone();

        metrics::ADAPTER_CHANGES
            .with_label_values(&["loaded"])
            .inc_by(report.loaded.len() as u64);
        metrics::ADAPTER_CHANGES
            .with_label_values(&["reweighted"])
            .inc_by(report.reweighted.len() as u64);

        if report.is_noop() {
            debug!(task_id, checkpoint, "Pipeline already in required state");
        } else {
            info!(
                task_id,
                checkpoint,
                checkpoint_reloaded = report.checkpoint_reloaded,
                loaded = ?report.loaded,
                reweighted = ?report.reweighted,
                "Pipeline reconciled"
            );
        }

        Ok(report)
    }

    async fn load_checkpoint(&self, reference: &str) -> Result<ModelHandle, PipelineError> {
        self.resolve(reference)
            .await
            .map_err(|reason| PipelineError::CheckpointUnavailable {
                reference: reference.to_string(),
                reason,
            })
    }

    async fn load_adapter(&self, reference: &str) -> Result<ModelHandle, PipelineError> {
        self.resolve(reference)
            .await
            .map_err(|reason| PipelineError::AdapterUnavailable {
                reference: reference.to_string(),
                reason,
            })
    }

    async fn resolve(&self, reference: &str) -> Result<ModelHandle, String> {
        if !self.models.exists(reference).await.map_err(|e| e.to_string())? {
            return Err("not found in model store".to_string());
        }
        self.models.load(reference).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SqlitePipelineStore;
    use crate::testing::MockModelStore;

    async fn setup(references: &[&str]) -> (PipelineManager, Arc<MockModelStore>, Arc<SqlitePipelineStore>) {
        let models = Arc::new(MockModelStore::with_models(references).await);
        let store = Arc::new(SqlitePipelineStore::in_memory().unwrap());
        let manager = PipelineManager::new(models.clone(), store.clone());
        (manager, models, store)
    }

    fn l(model: &str, weight: f32) -> AdapterSpec {
        AdapterSpec::new(model, weight)
    }

    #[tokio::test]
    async fn test_append_only_loads_delta() {
        let (mut manager, models, _) = setup(&["A", "L1", "L2"]).await;

        let first = manager
            .ensure("T1", "A", &[l("L1", 0.8)], AdapterMode::Replace)
            .await
            .unwrap();
        assert!(first.checkpoint_reloaded);
        assert_eq!(first.loaded, vec!["L1"]);

        models.clear_recorded_loads().await;
        let second = manager
            .ensure("T2", "A", &[l("L1", 0.8), l("L2", 0.5)], AdapterMode::Append)
            .await
            .unwrap();

        assert!(!second.checkpoint_reloaded);
        assert_eq!(second.loaded, vec!["L2"]);
        assert_eq!(second.untouched, vec!["L1"]);
        assert_eq!(models.recorded_loads().await, vec!["L2"]);

        let state = manager.status();
        assert_eq!(state.checkpoint.as_deref(), Some("A"));
        assert_eq!(state.adapters, vec![l("L1", 0.8), l("L2", 0.5)]);
        assert_eq!(state.last_task_id.as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn test_same_request_is_idempotent() {
        let (mut manager, models, _) = setup(&["A", "L1"]).await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0)], AdapterMode::Append)
            .await
            .unwrap();
        models.clear_recorded_loads().await;

        let report = manager
            .ensure("T2", "A", &[l("L1", 1.0)], AdapterMode::Append)
            .await
            .unwrap();
        assert!(report.is_noop());
        assert!(models.recorded_loads().await.is_empty());
    }

    #[tokio::test]
    async fn test_append_reweights_without_loading() {
        let (mut manager, models, _) = setup(&["A", "L1"]).await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0)], AdapterMode::Replace)
            .await
            .unwrap();
        models.clear_recorded_loads().await;

        let report = manager
            .ensure("T2", "A", &[l("L1", 0.4)], AdapterMode::Append)
            .await
            .unwrap();
        assert_eq!(report.reweighted, vec!["L1"]);
        assert!(models.recorded_loads().await.is_empty());
        assert_eq!(manager.status().adapters, vec![l("L1", 0.4)]);
    }

    #[tokio::test]
    async fn test_replace_swaps_full_set() {
        let (mut manager, models, _) = setup(&["A", "L1", "L2"]).await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0), l("L2", 1.0)], AdapterMode::Replace)
            .await
            .unwrap();
        models.clear_recorded_loads().await;

        let report = manager
            .ensure("T2", "A", &[l("L2", 1.0)], AdapterMode::Replace)
            .await
            .unwrap();
        assert!(!report.checkpoint_reloaded);
        assert_eq!(report.loaded, vec!["L2"]);
        assert_eq!(manager.status().adapters, vec![l("L2", 1.0)]);
    }

    #[tokio::test]
    async fn test_checkpoint_swap_reloads_adapters() {
        let (mut manager, models, _) = setup(&["A", "B", "L1"]).await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0)], AdapterMode::Append)
            .await
            .unwrap();
        models.clear_recorded_loads().await;

        let report = manager
            .ensure("T2", "B", &[], AdapterMode::Append)
            .await
            .unwrap();
        assert!(report.checkpoint_reloaded);
        assert_eq!(report.loaded, vec!["L1"]);
        assert_eq!(models.recorded_loads().await, vec!["B", "L1"]);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_keeps_last_good_state() {
        let (mut manager, _, store) = setup(&["A", "L1"]).await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0)], AdapterMode::Replace)
            .await
            .unwrap();
        let before = manager.status();

        let err = manager
            .ensure("T2", "Z", &[], AdapterMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointUnavailable { ref reference, .. } if reference == "Z"));
        assert_eq!(manager.status(), before);
        assert_eq!(store.load().unwrap(), Some(before.clone()));
        assert_eq!(manager.status_handle().get().await, before);
    }

    #[tokio::test]
    async fn test_failed_adapter_leaves_state_untouched() {
        let (mut manager, models, _) = setup(&["A", "B", "L1", "L2"]).await;
        models.mark_corrupt("L2").await;
        manager
            .ensure("T1", "A", &[l("L1", 1.0)], AdapterMode::Replace)
            .await
            .unwrap();

        let err = manager
            .ensure("T2", "B", &[l("L2", 1.0)], AdapterMode::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AdapterUnavailable { .. }));

        let handle = manager.handle().unwrap();
        assert_eq!(handle.checkpoint.reference, "A");
        assert_eq!(handle.adapters.len(), 1);
        assert_eq!(manager.status().checkpoint.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_new_manager_resets_previous_state() {
        let models: Arc<dyn ModelStore> = Arc::new(MockModelStore::new());
        let store = Arc::new(SqlitePipelineStore::in_memory().unwrap());
        store
            .save(&PipelineState {
                checkpoint: Some("A".to_string()),
                adapters: vec![],
                last_task_id: Some("T0".to_string()),
            })
            .unwrap();

        let manager = PipelineManager::new(models, store.clone());
        assert!(manager.handle().is_none());
        assert_eq!(store.load().unwrap(), Some(PipelineState::default()));
    }
}
