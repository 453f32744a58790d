//! Scheduler coordinator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::executor::TaskExecutor;
use super::types::{
    CancelOutcome, PromoteOutcome, QueueSnapshot, RunningTaskView, SchedulerError, SubmitReceipt,
    TaskPosition,
};
use crate::batch::{BatchFailure, BatchItem, BatchResult};
use crate::config::SchedulerConfig;
use crate::generator::Generator;
use crate::metrics;
use crate::model_store::ModelStore;
use crate::pipeline::{PipelineManager, PipelineState, PipelineStateStore, PipelineStatusHandle};
use crate::progress::{ProgressEvent, SharedBroadcaster, QUEUE_TOPIC};
use crate::queue::{QueueError, TaskQueue};
use crate::task::{GenerationRequest, Task, TaskStatus, TaskStore};

/// Error recorded on tasks that were running when the process stopped.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// How long `stop` waits for the task in flight before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Mutable scheduler state, guarded by one lock.
pub(super) struct QueueState {
    pub(super) queue: TaskQueue,
    /// Wall-clock and monotonic start of the running task.
    pub(super) running_since: Option<(DateTime<Utc>, Instant)>,
    pub(super) progress: Option<f32>,
    /// Durations of recently finished tasks, newest last.
    pub(super) durations: VecDeque<Duration>,
    pub(super) last_promotion: DateTime<Utc>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queue: TaskQueue::new(),
            running_since: None,
            progress: None,
            durations: VecDeque::new(),
            last_promotion: DateTime::<Utc>::default(),
        }
    }

    fn eta_secs(&self) -> Option<u64> {
        let (_, started) = self.running_since?;
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        let mean = total / self.durations.len() as u32;
        Some(mean.saturating_sub(started.elapsed()).as_secs())
    }

    /// A promotion time strictly later than every previous one.
    fn next_promotion_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = if now > self.last_promotion {
            now
        } else {
            self.last_promotion + chrono::Duration::microseconds(1)
        };
        self.last_promotion = next;
        next
    }
}

/// State shared between the coordinator and the executor.
pub(super) struct Shared {
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) state: Mutex<QueueState>,
    pub(super) progress: SharedBroadcaster,
    pub(super) wake: Notify,
    pub(super) pipeline_status: PipelineStatusHandle,
    pub(super) eta_window: usize,
}

impl Shared {
    pub(super) async fn snapshot(&self, state: &QueueState) -> QueueSnapshot {
        let running = match (state.queue.running(), state.running_since) {
            (Some(task), Some((started_at, _))) => Some(RunningTaskView {
                id: task.id.clone(),
                checkpoint: task.checkpoint.clone(),
                started_at,
                progress: state.progress,
                eta_secs: state.eta_secs(),
            }),
            _ => None,
        };
        let pending = state.queue.snapshot();

        QueueSnapshot {
            running,
            active_checkpoint: self.pipeline_status.get().await.checkpoint,
            queue_length: pending.len(),
            pending,
        }
    }

    /// Publish the queue snapshot. Callers hold the state lock, so
    /// snapshots go out in mutation order.
    pub(super) async fn publish(&self, state: &QueueState) {
        let snapshot = self.snapshot(state).await;
        self.progress
            .publish(QUEUE_TOPIC, ProgressEvent::Queue(snapshot));
    }
}

/// Façade over the task queue, the executor and the pipeline.
pub struct SchedulerCoordinator {
    config: SchedulerConfig,
    shared: Arc<Shared>,
    pipeline: Arc<Mutex<PipelineManager>>,
    generator: Arc<dyn Generator>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    executor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerCoordinator {
    /// Create a new coordinator. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        models: Arc<dyn ModelStore>,
        pipeline_store: Arc<dyn PipelineStateStore>,
        generator: Arc<dyn Generator>,
        progress: SharedBroadcaster,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let pipeline = PipelineManager::new(models, pipeline_store);

        let shared = Arc::new(Shared {
            store,
            state: Mutex::new(QueueState::new()),
            progress,
            wake: Notify::new(),
            pipeline_status: pipeline.status_handle(),
            eta_window: config.eta_window.max(1),
        });

        Self {
            config,
            shared,
            pipeline: Arc::new(Mutex::new(pipeline)),
            generator,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            executor: std::sync::Mutex::new(None),
        }
    }

    /// Recover persisted work and spawn the executor.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return Ok(());
        }

        info!("Starting scheduler");

        if let Err(e) = self.recover().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if !self.config.enabled {
            info!("Task executor disabled by configuration");
            return Ok(());
        }

        let executor = TaskExecutor::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.generator),
        );
        let handle = tokio::spawn(executor.run(self.shutdown_tx.subscribe()));
        *self.executor.lock().unwrap() = Some(handle);

        info!("Scheduler started");
        Ok(())
    }

    /// Stop the executor. A task in flight gets a grace period to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping scheduler");

        // Signal shutdown to the executor
        let _ = self.shutdown_tx.send(());

        let handle = self.executor.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Task executor did not stop in time, aborting it");
                handle.abort();
            }
        }

        info!("Scheduler stopped");
    }

    /// Whether the scheduler has been started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Rebuild the queue from the task store.
    ///
    /// Tasks left `running` by a previous process are failed; pending tasks
    /// are re-queued by promotion time, then creation time. Tasks already
    /// queued are skipped, so calling this twice is harmless.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let mut state = self.shared.state.lock().await;
        let now = Utc::now();

        for task in self.shared.store.list(Some(TaskStatus::Running))? {
            if state.queue.running().is_some_and(|r| r.id == task.id) {
                continue;
            }
            self.shared
                .store
                .mark_failed(&task.id, INTERRUPTED_ERROR, now)?;
            metrics::TASKS_TOTAL.with_label_values(&["failed"]).inc();
            warn!(task_id = %task.id, "Task was interrupted by restart, marked failed");
        }

        let mut pending = self.shared.store.list(Some(TaskStatus::Pending))?;
        pending.sort_by(|a, b| {
            b.promoted_at
                .cmp(&a.promoted_at)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut restored = 0;
        for task in pending {
            if state.queue.position(&task.id).is_some() {
                continue;
            }
            state.last_promotion = state.last_promotion.max(task.promoted_at);
            state.queue.submit(task);
            restored += 1;
        }

        if restored > 0 {
            info!(restored, "Restored pending tasks");
            self.shared.wake.notify_one();
        }
        self.shared.publish(&state).await;
        Ok(restored)
    }

    /// Validate, persist and enqueue a new task.
    pub async fn submit(&self, request: GenerationRequest) -> Result<SubmitReceipt, SchedulerError> {
        request.validate().map_err(SchedulerError::Validation)?;

        let task = Task::from_request(request, Utc::now());
        let id = task.id.clone();
        let checkpoint = task.checkpoint.clone();

        let mut state = self.shared.state.lock().await;
        self.shared.store.insert(&task)?;
        let position = state.queue.submit(task);
        self.shared.publish(&state).await;
        drop(state);

        self.shared.wake.notify_one();
        metrics::TASKS_TOTAL.with_label_values(&["submitted"]).inc();
        info!(task_id = %id, %checkpoint, position, "Task submitted");

        Ok(SubmitReceipt { id, position })
    }

    /// Cancel pending tasks. Each id succeeds or fails on its own.
    pub async fn cancel(&self, ids: &[String]) -> CancelOutcome {
        let mut state = self.shared.state.lock().await;
        let mut result: BatchResult<()> = BatchResult::new();

        for id in ids {
            let item = match state.queue.check_cancellable(id) {
                Ok(()) => match self.shared.store.mark_cancelled(id, Utc::now()) {
                    Ok(_) => {
                        state.queue.cancel_one(id).ok();
                        metrics::TASKS_TOTAL.with_label_values(&["cancelled"]).inc();
                        info!(task_id = %id, "Task cancelled");
                        BatchItem::ok(id.clone(), ())
                    }
                    Err(e) => BatchItem::err(id.clone(), e.to_string()),
                },
                Err(QueueError::NotFound) => BatchItem::err(id.clone(), self.unqueued_reason(id)),
                Err(e) => BatchItem::err(id.clone(), e.to_string()),
            };
            result.push(item);
        }

        if result.succeeded().next().is_some() {
            self.shared.publish(&state).await;
        }

        CancelOutcome {
            cancelled: result.succeeded_ids(),
            failed: result.failures(),
        }
    }

    /// Promote pending tasks to the front of the queue.
    ///
    /// All tasks in the batch share one promotion time, later than any
    /// earlier promotion.
    pub async fn promote(&self, ids: &[String]) -> PromoteOutcome {
        let mut state = self.shared.state.lock().await;
        let at = state.next_promotion_time();

        let mut rejected: Vec<BatchItem<usize>> = Vec::new();
        let mut eligible: Vec<String> = Vec::new();
        for id in ids {
            match state.queue.check_promotable(id) {
                Ok(()) => match self.shared.store.set_promoted_at(id, at) {
                    Ok(_) => eligible.push(id.clone()),
                    Err(e) => rejected.push(BatchItem::err(id.clone(), e.to_string())),
                },
                Err(QueueError::NotFound) => {
                    rejected.push(BatchItem::err(id.clone(), self.unqueued_reason(id)))
                }
                Err(e) => rejected.push(BatchItem::err(id.clone(), e.to_string())),
            }
        }

        let promoted = state.queue.promote(&eligible, at);
        if !eligible.is_empty() {
            metrics::TASKS_TOTAL
                .with_label_values(&["promoted"])
                .inc_by(eligible.len() as u64);
            debug!(promoted = ?eligible, "Tasks promoted");
            self.shared.publish(&state).await;
        }

        // Report in request order
        let mut outcome = PromoteOutcome::default();
        for id in ids {
            if let Some((_, position)) = promoted.succeeded().find(|(pid, _)| *pid == id.as_str()) {
                if !outcome.updated.contains(id) {
                    outcome.updated.push(id.clone());
                    outcome.new_positions.push(TaskPosition {
                        id: id.clone(),
                        position: *position,
                    });
                }
            } else if let Some(BatchItem::Err { reason, .. }) =
                rejected.iter().find(|item| item.id() == id.as_str())
            {
                outcome.failed.push(BatchFailure {
                    id: id.clone(),
                    reason: reason.clone(),
                });
            }
        }
        outcome
    }

    /// Get a task by id.
    pub async fn get(&self, id: &str) -> Result<Option<Task>, SchedulerError> {
        Ok(self.shared.store.get(id)?)
    }

    /// List tasks, optionally by status.
    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.shared.store.list(status)?)
    }

    /// Current queue snapshot.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state.lock().await;
        self.shared.snapshot(&state).await
    }

    /// Stream of queue snapshots, starting with the current one.
    pub async fn subscribe(&self) -> BoxStream<'static, QueueSnapshot> {
        let state = self.shared.state.lock().await;
        if self.shared.progress.latest(QUEUE_TOPIC).is_none() {
            self.shared.publish(&state).await;
        }
        let stream = self.shared.progress.subscribe(QUEUE_TOPIC);
        drop(state);

        stream
            .filter_map(|event| async move {
                match event {
                    ProgressEvent::Queue(snapshot) => Some(snapshot),
                    ProgressEvent::Download(_) => None,
                }
            })
            .boxed()
    }

    /// Current pipeline state.
    pub async fn pipeline_status(&self) -> PipelineState {
        self.shared.pipeline_status.get().await
    }

    /// Why an id that is not in the queue cannot be acted on.
    fn unqueued_reason(&self, id: &str) -> String {
        match self.shared.store.get(id) {
            Ok(Some(task)) if task.status.is_terminal() => format!("task already {}", task.status),
            Ok(Some(task)) => format!("task is {} but not queued", task.status),
            Ok(None) => QueueError::NotFound.to_string(),
            Err(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SqlitePipelineStore;
    use crate::progress::ProgressBroadcaster;
    use crate::task::SqliteTaskStore;
    use crate::testing::{MockGenerator, MockModelStore};

    fn coordinator_with_store(store: Arc<SqliteTaskStore>) -> SchedulerCoordinator {
        SchedulerCoordinator::new(
            SchedulerConfig::default(),
            store,
            Arc::new(MockModelStore::new()),
            Arc::new(SqlitePipelineStore::in_memory().unwrap()),
            Arc::new(MockGenerator::new()),
            Arc::new(ProgressBroadcaster::new(16)),
        )
    }

    fn coordinator() -> SchedulerCoordinator {
        coordinator_with_store(Arc::new(SqliteTaskStore::in_memory().unwrap()))
    }

    async fn order(coordinator: &SchedulerCoordinator) -> Vec<String> {
        coordinator
            .snapshot()
            .await
            .pending
            .into_iter()
            .map(|t| t.id)
            .collect()
    }

    #[tokio::test]
    async fn test_submit_persists_and_queues() {
        let coordinator = coordinator();
        let receipt = coordinator
            .submit(GenerationRequest::new("A"))
            .await
            .unwrap();

        assert_eq!(receipt.position, 0);
        let task = coordinator.get(&receipt.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(coordinator.snapshot().await.queue_length, 1);
    }

    #[tokio::test]
    async fn test_invalid_submission_changes_nothing() {
        let coordinator = coordinator();
        let err = coordinator
            .submit(GenerationRequest::new("A").with_adapter("L1", 9.0))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(coordinator.list(None).await.unwrap().is_empty());
        assert_eq!(coordinator.snapshot().await.queue_length, 0);
    }

    #[tokio::test]
    async fn test_submission_with_path_reference_is_rejected() {
        let coordinator = coordinator();
        for request in [
            GenerationRequest::new("/tmp/secret"),
            GenerationRequest::new("A").with_adapter("../L1", 0.5),
        ] {
            let err = coordinator.submit(request).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Validation(_)));
        }
        assert!(coordinator.list(None).await.unwrap().is_empty());
        assert_eq!(coordinator.snapshot().await.queue_length, 0);
    }

    #[tokio::test]
    async fn test_cancel_batch_with_unknown_id() {
        let coordinator = coordinator();
        let t1 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;
        let t2 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;
        let t3 = coordinator.submit(GenerationRequest::new("B")).await.unwrap().id;

        let outcome = coordinator
            .cancel(&[t2.clone(), "T9".to_string()])
            .await;

        assert_eq!(outcome.cancelled, vec![t2.clone()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].id, "T9");
        assert_eq!(outcome.failed[0].reason, "not found");
        assert_eq!(order(&coordinator).await, vec![t1, t3]);
        assert_eq!(
            coordinator.get(&t2).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_reports_status() {
        let coordinator = coordinator();
        let t1 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;
        coordinator.cancel(&[t1.clone()]).await;

        let outcome = coordinator.cancel(&[t1.clone()]).await;
        assert!(outcome.cancelled.is_empty());
        assert_eq!(outcome.failed[0].reason, "task already cancelled");
    }

    #[tokio::test]
    async fn test_promote_reorders_queue() {
        let coordinator = coordinator();
        let t1 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;
        let t2 = coordinator.submit(GenerationRequest::new("B")).await.unwrap().id;
        let t3 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;

        let outcome = coordinator.promote(&[t2.clone()]).await;
        assert_eq!(outcome.updated, vec![t2.clone()]);
        assert_eq!(
            outcome.new_positions,
            vec![TaskPosition {
                id: t2.clone(),
                position: 0
            }]
        );
        assert_eq!(order(&coordinator).await, vec![t2.clone(), t1, t3]);

        let stored = coordinator.get(&t2).await.unwrap().unwrap();
        assert!(stored.promoted_at.timestamp() > 0);
    }

    #[tokio::test]
    async fn test_promotion_time_only_moves_forward() {
        let coordinator = coordinator();
        let t1 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;
        let t2 = coordinator.submit(GenerationRequest::new("B")).await.unwrap().id;

        coordinator.promote(&[t1.clone()]).await;
        coordinator.promote(&[t2.clone()]).await;

        let p1 = coordinator.get(&t1).await.unwrap().unwrap().promoted_at;
        let p2 = coordinator.get(&t2).await.unwrap().unwrap().promoted_at;
        assert!(p2 > p1);
        assert_eq!(order(&coordinator).await, vec![t2, t1]);
    }

    #[tokio::test]
    async fn test_promote_unknown_fails_per_id() {
        let coordinator = coordinator();
        let t1 = coordinator.submit(GenerationRequest::new("A")).await.unwrap().id;

        let outcome = coordinator
            .promote(&["missing".to_string(), t1.clone()])
            .await;
        assert_eq!(outcome.updated, vec![t1]);
        assert_eq!(outcome.failed[0].id, "missing");
        assert_eq!(outcome.failed[0].reason, "not found");
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_snapshot() {
        let coordinator = coordinator();
        coordinator.submit(GenerationRequest::new("A")).await.unwrap();
        coordinator.submit(GenerationRequest::new("B")).await.unwrap();

        let mut updates = coordinator.subscribe().await;
        let first = updates.next().await.unwrap();
        assert_eq!(first.queue_length, 2);

        coordinator.submit(GenerationRequest::new("C")).await.unwrap();
        let second = updates.next().await.unwrap();
        assert_eq!(second.queue_length, 3);
    }

    #[tokio::test]
    async fn test_recover_restores_pending_and_fails_interrupted() {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let base = Utc::now();

        let interrupted = Task::from_request(GenerationRequest::new("A"), base);
        store.insert(&interrupted).unwrap();
        store.mark_running(&interrupted.id, base).unwrap();

        let older = Task::from_request(GenerationRequest::new("A"), base);
        let newer = Task::from_request(
            GenerationRequest::new("B"),
            base + chrono::Duration::seconds(1),
        );
        let promoted = Task::from_request(
            GenerationRequest::new("C"),
            base + chrono::Duration::seconds(2),
        );
        for task in [&older, &newer, &promoted] {
            store.insert(task).unwrap();
        }
        store
            .set_promoted_at(&promoted.id, base + chrono::Duration::seconds(3))
            .unwrap();

        let coordinator = coordinator_with_store(store.clone());
        let restored = coordinator.recover().await.unwrap();
        assert_eq!(restored, 3);
        assert_eq!(
            order(&coordinator).await,
            vec![promoted.id.clone(), older.id.clone(), newer.id.clone()]
        );

        let failed = store.get(&interrupted.id).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(INTERRUPTED_ERROR));

        // Running recovery again does not duplicate anything.
        assert_eq!(coordinator.recover().await.unwrap(), 0);
        assert_eq!(order(&coordinator).await.len(), 3);

        // New promotions land after the recovered one.
        coordinator.promote(&[newer.id.clone()]).await;
        assert_eq!(order(&coordinator).await[0], newer.id);
    }
}
