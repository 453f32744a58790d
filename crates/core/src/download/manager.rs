//! Download manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fetcher::Fetcher;
use super::retry::RetryPolicy;
use super::worker::{Control, Worker};
use super::{
    download_id, DownloadAction, DownloadError, DownloadSnapshot, DownloadStatus, DownloadStore,
    DownloadTask, SourceDescriptor,
};
use crate::batch::{BatchFailure, BatchItem, BatchResult};
use crate::config::DownloadConfig;
use crate::metrics;
use crate::model_store::ModelStore;
use crate::progress::{download_topic, ProgressEvent, SharedBroadcaster};

/// How long `shutdown` waits for workers before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Result of a batch action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchActionOutcome {
    pub updated: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// One async lock per key, dropped once nobody holds it.
#[derive(Default)]
struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

struct WorkerHandle {
    generation: u64,
    control: watch::Sender<Control>,
    join: JoinHandle<()>,
}

/// State shared between the manager and its workers.
pub(super) struct Shared {
    pub(super) config: DownloadConfig,
    pub(super) models_dir: PathBuf,
    pub(super) store: Arc<dyn DownloadStore>,
    pub(super) fetcher: Arc<dyn Fetcher>,
    pub(super) models: Arc<dyn ModelStore>,
    pub(super) progress: SharedBroadcaster,
    pub(super) retry: RetryPolicy,
    pub(super) permits: Arc<Semaphore>,
    locks: KeyedLocks,
    workers: std::sync::Mutex<HashMap<String, WorkerHandle>>,
    next_generation: AtomicU64,
}

impl Shared {
    /// Where the partial data of a download lives.
    pub(super) fn partial_path(&self, task: &DownloadTask) -> PathBuf {
        self.models_dir
            .join(format!("{}{}.downloading", task.id, task.source.extension()))
    }

    /// Persist a record, stamping `updated_at`.
    pub(super) fn save(&self, task: &mut DownloadTask) -> Result<(), DownloadError> {
        task.updated_at = Utc::now();
        self.store.update(task)?;
        Ok(())
    }

    pub(super) fn publish(&self, snapshot: DownloadSnapshot) {
        self.progress
            .publish(&download_topic(&snapshot.id), ProgressEvent::Download(snapshot));
    }

    pub(super) fn publish_task(&self, task: &DownloadTask) {
        self.publish(DownloadSnapshot::from_task(task));
    }

    /// Drop the worker entry unless a newer worker replaced it.
    pub(super) fn forget_worker(&self, id: &str, generation: u64) {
        let mut workers = self.workers.lock().unwrap();
        if workers.get(id).is_some_and(|w| w.generation == generation) {
            workers.remove(id);
        }
    }

    fn has_worker(&self, id: &str) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|w| !w.join.is_finished())
    }
}

/// Drives resumable downloads of model artifacts.
///
/// Each active download gets one worker task; a semaphore bounds how many
/// of them transfer at once. Operations on one id are serialized through a
/// per-id lock, and a live worker is the only writer of its record.
pub struct DownloadManager {
    shared: Arc<Shared>,
    shutting_down: AtomicBool,
}

impl DownloadManager {
    pub fn new(
        config: DownloadConfig,
        models_dir: PathBuf,
        store: Arc<dyn DownloadStore>,
        fetcher: Arc<dyn Fetcher>,
        models: Arc<dyn ModelStore>,
        progress: SharedBroadcaster,
    ) -> Self {
        let shared = Arc::new(Shared {
            retry: RetryPolicy::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            models_dir,
            store,
            fetcher,
            models,
            progress,
            locks: KeyedLocks::default(),
            workers: std::sync::Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        });

        Self {
            shared,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Create a download for a source, or return the one that exists.
    ///
    /// Completed, pending, downloading and failed records are returned
    /// as they are. A paused record is resumed. A cancelled record is
    /// replaced by a fresh download.
    pub async fn submit(&self, source: SourceDescriptor) -> Result<DownloadTask, DownloadError> {
        source.validate()?;
        self.ensure_running()?;

        let id = download_id(&source);
        let _guard = self.shared.locks.lock(&id).await;

        if let Some(mut existing) = self.shared.store.get(&id)? {
            match existing.status {
                DownloadStatus::Completed | DownloadStatus::Failed => {
                    debug!(download_id = %id, status = %existing.status, "Download already known");
                    return Ok(existing);
                }
                DownloadStatus::Pending | DownloadStatus::Downloading => {
                    if !self.shared.has_worker(&id) {
                        self.spawn_worker(&id);
                    }
                    debug!(download_id = %id, "Download already in progress");
                    return Ok(existing);
                }
                DownloadStatus::Paused => {
                    info!(download_id = %id, "Resubmitted paused download, resuming");
                    existing.status = DownloadStatus::Pending;
                    self.shared.save(&mut existing)?;
                    self.shared.publish_task(&existing);
                    self.spawn_worker(&id);
                    return Ok(existing);
                }
                DownloadStatus::Cancelled => {
                    debug!(download_id = %id, "Replacing cancelled download");
                }
            }
        }

        let mut task = DownloadTask::new(source, self.shared.config.max_retries, Utc::now());

        if self.already_stored(&mut task).await {
            self.shared.store.replace(&task)?;
            self.shared.publish_task(&task);
            info!(download_id = %id, "Artifact already present, nothing to download");
            return Ok(task);
        }

        self.shared.store.replace(&task)?;
        self.shared.publish_task(&task);
        self.spawn_worker(&id);
        info!(download_id = %id, url = %task.source.url, "Download submitted");
        Ok(task)
    }

    /// Complete the record on the spot when the model store already holds
    /// the expected artifact.
    async fn already_stored(&self, task: &mut DownloadTask) -> bool {
        let Some(hash) = task.source.normalized_sha256() else {
            return false;
        };
        let handle = match self.shared.models.exists(&hash).await {
            Ok(true) => self.shared.models.load(&hash).await,
            Ok(false) => return false,
            Err(e) => Err(e),
        };
        match handle {
            Ok(handle) => {
                let now = Utc::now();
                task.status = DownloadStatus::Completed;
                task.total_bytes = Some(handle.size_bytes);
                task.downloaded_bytes = handle.size_bytes;
                task.resume_offset = handle.size_bytes;
                task.file_path = Some(handle.path);
                task.sha256 = Some(handle.reference);
                task.completed_at = Some(now);
                task.updated_at = now;
                true
            }
            Err(e) => {
                warn!(download_id = %task.id, "Could not check the model store, downloading: {}", e);
                false
            }
        }
    }

    /// Apply an action to one download and return the resulting record.
    ///
    /// For `remove` the returned record is the one that was deleted.
    pub async fn action(
        &self,
        id: &str,
        action: DownloadAction,
    ) -> Result<DownloadTask, DownloadError> {
        let _guard = self.shared.locks.lock(id).await;
        let task = self
            .shared
            .store
            .get(id)?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let invalid = |status: DownloadStatus| DownloadError::InvalidState {
            id: id.to_string(),
            status,
            action,
        };

        match action {
            DownloadAction::Pause => {
                if !matches!(task.status, DownloadStatus::Pending | DownloadStatus::Downloading) {
                    return Err(invalid(task.status));
                }
                let stopped = self.stop_worker(id, Control::Pause).await;
                // A worker may have moved the record on since it was read
                let mut task = self.reload(id)?;
                if stopped
                    || !matches!(task.status, DownloadStatus::Pending | DownloadStatus::Downloading)
                {
                    return match task.status {
                        DownloadStatus::Paused => Ok(task),
                        other => Err(invalid(other)),
                    };
                }

                task.status = DownloadStatus::Paused;
                task.resume_offset = task.resume_offset.min(task.downloaded_bytes);
                task.downloaded_bytes = task.resume_offset;
                self.shared.save(&mut task)?;
                self.shared.publish_task(&task);
                metrics::DOWNLOADS_TOTAL.with_label_values(&["paused"]).inc();
                info!(download_id = %id, "Download paused");
                Ok(task)
            }
            DownloadAction::Resume => {
                let resumable = match task.status {
                    DownloadStatus::Paused | DownloadStatus::Failed => true,
                    DownloadStatus::Pending => !self.shared.has_worker(id),
                    _ => false,
                };
                if !resumable {
                    return Err(invalid(task.status));
                }
                self.ensure_running()?;

                let mut task = task;
                if task.status == DownloadStatus::Failed {
                    task.retry_count = 0;
                    task.error = None;
                    task.completed_at = None;
                }
                task.status = DownloadStatus::Pending;
                self.shared.save(&mut task)?;
                self.shared.publish_task(&task);
                self.spawn_worker(id);
                info!(download_id = %id, offset = task.resume_offset, "Download resumed");
                Ok(task)
            }
            DownloadAction::Cancel => {
                if !task.status.is_active() {
                    return Err(invalid(task.status));
                }
                let stopped = self.stop_worker(id, Control::Cancel).await;
                let mut task = self.reload(id)?;
                if stopped || !task.status.is_active() {
                    return match task.status {
                        DownloadStatus::Cancelled => Ok(task),
                        other => Err(invalid(other)),
                    };
                }

                discard_partial(&self.shared.partial_path(&task)).await;
                task.status = DownloadStatus::Cancelled;
                task.downloaded_bytes = 0;
                task.resume_offset = 0;
                task.completed_at = Some(Utc::now());
                self.shared.save(&mut task)?;
                self.shared.publish_task(&task);
                metrics::DOWNLOADS_TOTAL.with_label_values(&["cancelled"]).inc();
                info!(download_id = %id, "Download cancelled");
                Ok(task)
            }
            DownloadAction::Remove => {
                if !task.status.is_terminal() {
                    return Err(invalid(task.status));
                }
                if task.status != DownloadStatus::Completed {
                    discard_partial(&self.shared.partial_path(&task)).await;
                }
                self.shared.store.delete(id)?;
                self.shared.progress.close(&download_topic(id));
                info!(download_id = %id, "Download removed");
                Ok(task)
            }
        }
    }

    /// Apply one action to many downloads. Each id succeeds or fails on
    /// its own.
    pub async fn batch_action(&self, ids: &[String], action: DownloadAction) -> BatchActionOutcome {
        let mut result: BatchResult<()> = BatchResult::new();
        for id in ids {
            let item = match self.action(id, action).await {
                Ok(_) => BatchItem::ok(id.clone(), ()),
                Err(e) => BatchItem::err(id.clone(), e.to_string()),
            };
            result.push(item);
        }

        BatchActionOutcome {
            updated: result.succeeded_ids(),
            failed: result.failures(),
        }
    }

    /// Get a download by id.
    pub async fn get(&self, id: &str) -> Result<Option<DownloadTask>, DownloadError> {
        Ok(self.shared.store.get(id)?)
    }

    /// List downloads, optionally by status.
    pub async fn list(
        &self,
        status: Option<DownloadStatus>,
    ) -> Result<Vec<DownloadTask>, DownloadError> {
        Ok(self.shared.store.list(status)?)
    }

    /// Delete every completed, failed or cancelled record. Artifacts stay
    /// in the model store; partial files of unfinished ones are removed.
    pub async fn purge_completed(&self) -> Result<usize, DownloadError> {
        let removed = self.shared.store.delete_terminal()?;
        for task in &removed {
            if task.status != DownloadStatus::Completed {
                discard_partial(&self.shared.partial_path(task)).await;
            }
            self.shared.progress.close(&download_topic(&task.id));
        }
        info!(count = removed.len(), "Purged finished downloads");
        Ok(removed.len())
    }

    /// Stream of snapshots for one download, starting with the current one.
    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, DownloadSnapshot>, DownloadError> {
        let _guard = self.shared.locks.lock(id).await;
        let topic = download_topic(id);
        if self.shared.progress.latest(&topic).is_none() {
            let task = self
                .shared
                .store
                .get(id)?
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            self.shared.publish_task(&task);
        }

        Ok(self
            .shared
            .progress
            .subscribe(&topic)
            .filter_map(|event| async move {
                match event {
                    ProgressEvent::Download(snapshot) => Some(snapshot),
                    ProgressEvent::Queue(_) => None,
                }
            })
            .boxed())
    }

    /// Restart downloads left pending or downloading by a previous process.
    /// Paused downloads stay paused.
    pub async fn recover(&self) -> Result<usize, DownloadError> {
        self.ensure_running()?;

        let mut restarted = 0;
        for mut task in self.shared.store.list(None)? {
            let _guard = self.shared.locks.lock(&task.id).await;
            if matches!(task.status, DownloadStatus::Pending | DownloadStatus::Downloading)
                && !self.shared.has_worker(&task.id)
            {
                task.status = DownloadStatus::Pending;
                self.shared.save(&mut task)?;
                self.spawn_worker(&task.id);
                restarted += 1;
            }
            self.shared.publish_task(&task);
        }

        if restarted > 0 {
            info!(restarted, "Restarted interrupted downloads");
        }
        Ok(restarted)
    }

    /// Stop every worker. Transfers keep their status and offsets, so
    /// [`recover`](Self::recover) picks them up on the next start.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping download manager");

        let workers: Vec<(String, WorkerHandle)> =
            self.shared.workers.lock().unwrap().drain().collect();
        for (_, worker) in &workers {
            let _ = worker.control.send(Control::Shutdown);
        }
        for (id, mut worker) in workers {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker.join).await.is_err() {
                warn!(download_id = %id, "Download worker did not stop in time, aborting it");
                worker.join.abort();
            }
        }

        info!("Download manager stopped");
    }

    /// Number of workers currently alive.
    pub fn active_workers(&self) -> usize {
        self.shared
            .workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| !w.join.is_finished())
            .count()
    }

    fn ensure_running(&self) -> Result<(), DownloadError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DownloadError::ShuttingDown);
        }
        Ok(())
    }

    fn reload(&self, id: &str) -> Result<DownloadTask, DownloadError> {
        self.shared
            .store
            .get(id)?
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))
    }

    /// Spawn a worker for `id`. Callers hold the id's lock.
    fn spawn_worker(&self, id: &str) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let worker = Worker::new(Arc::clone(&self.shared), id.to_string(), generation, control_rx);
        let join = tokio::spawn(worker.run());

        let previous = self.shared.workers.lock().unwrap().insert(
            id.to_string(),
            WorkerHandle {
                generation,
                control: control_tx,
                join,
            },
        );
        if let Some(previous) = previous {
            if !previous.join.is_finished() {
                error!(download_id = %id, "Replaced a live download worker");
                let _ = previous.control.send(Control::Shutdown);
            }
        }
    }

    /// Signal the worker for `id` and wait until it exits. Returns false if
    /// no worker was running. Callers hold the id's lock.
    async fn stop_worker(&self, id: &str, signal: Control) -> bool {
        let worker = self.shared.workers.lock().unwrap().remove(id);
        let Some(worker) = worker else {
            return false;
        };
        if worker.join.is_finished() {
            return false;
        }

        let _ = worker.control.send(signal);
        if let Err(e) = worker.join.await {
            error!(download_id = %id, "Download worker panicked: {}", e);
        }
        true
    }
}

/// Delete a partial file, ignoring a missing one.
pub(super) async fn discard_partial(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove partial file: {}", e),
    }
}
