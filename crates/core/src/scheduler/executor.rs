//! The single task executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

use super::coordinator::Shared;
use crate::generator::{GenerationProgress, Generator};
use crate::metrics;
use crate::pipeline::PipelineManager;
use crate::task::{Task, TaskStoreError};

/// Pause before retrying after the task store refused a dequeue.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

enum Dequeue {
    Task(Task),
    Empty,
    /// The head was dropped; look again.
    Skipped,
}

/// Drains the queue one task at a time.
///
/// The executor is the only caller of the generator and the only writer of
/// the pipeline, which keeps the GPU exclusive.
pub(super) struct TaskExecutor {
    shared: Arc<Shared>,
    pipeline: Arc<Mutex<PipelineManager>>,
    generator: Arc<dyn Generator>,
}

impl TaskExecutor {
    pub(super) fn new(
        shared: Arc<Shared>,
        pipeline: Arc<Mutex<PipelineManager>>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            shared,
            pipeline,
            generator,
        }
    }

    /// Run until shutdown. A task that already started is always finished
    /// before the shutdown signal is observed.
    pub(super) async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Task executor started");
        loop {
            let task = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Task executor received shutdown signal");
                    break;
                }
                task = self.next_task() => task,
            };
            self.run_task(task).await;
        }
        info!("Task executor stopped");
    }

    /// Block until a task can be moved into the running slot.
    async fn next_task(&self) -> Task {
        loop {
            match self.try_dequeue().await {
                Ok(Dequeue::Task(task)) => return task,
                Ok(Dequeue::Skipped) => continue,
                Ok(Dequeue::Empty) => self.shared.wake.notified().await,
                Err(e) => {
                    error!("Failed to start next task: {}", e);
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_dequeue(&self) -> Result<Dequeue, TaskStoreError> {
        let mut state = self.shared.state.lock().await;
        let Some(head) = state.queue.peek() else {
            return Ok(Dequeue::Empty);
        };
        let id = head.id.clone();

        match self.shared.store.mark_running(&id, Utc::now()) {
            Ok(task) => {
                if let Err(e) = state.queue.start(&id) {
                    warn!(task_id = %id, "Queue refused to start task: {}", e);
                }
                state.running_since = Some((task.started_at.unwrap_or_else(Utc::now), Instant::now()));
                state.progress = None;
                self.shared.publish(&state).await;
                Ok(Dequeue::Task(task))
            }
            Err(e @ (TaskStoreError::InvalidState { .. } | TaskStoreError::NotFound(_))) => {
                warn!(task_id = %id, "Dropping task that can no longer run: {}", e);
                state.queue.remove(&id);
                self.shared.publish(&state).await;
                Ok(Dequeue::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_task(&self, task: Task) {
        let started = Instant::now();
        info!(task_id = %task.id, checkpoint = %task.checkpoint, "Task started");

        let outcome = self.execute(&task).await;
        let elapsed = started.elapsed();
        let now = Utc::now();

        let persisted = match &outcome {
            Ok(result) => {
                info!(task_id = %task.id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                metrics::TASKS_TOTAL.with_label_values(&["completed"]).inc();
                metrics::TASK_DURATION
                    .with_label_values(&["completed"])
                    .observe(elapsed.as_secs_f64());
                self.shared.store.mark_completed(&task.id, result, now)
            }
            Err(reason) => {
                warn!(task_id = %task.id, "Task failed: {}", reason);
                metrics::TASKS_TOTAL.with_label_values(&["failed"]).inc();
                metrics::TASK_DURATION
                    .with_label_values(&["failed"])
                    .observe(elapsed.as_secs_f64());
                self.shared.store.mark_failed(&task.id, reason, now)
            }
        };
        if let Err(e) = persisted {
            error!(task_id = %task.id, "Failed to persist task outcome: {}", e);
        }

        let mut state = self.shared.state.lock().await;
        state.queue.remove(&task.id);
        state.running_since = None;
        state.progress = None;
        if outcome.is_ok() {
            state.durations.push_back(elapsed);
            while state.durations.len() > self.shared.eta_window {
                state.durations.pop_front();
            }
        }
        self.shared.publish(&state).await;
    }

    /// Reconcile the pipeline and run the generator, relaying progress.
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, String> {
        let handle = {
            let mut pipeline = self.pipeline.lock().await;
            pipeline
                .ensure(&task.id, &task.checkpoint, &task.adapters, task.adapter_mode)
                .await
                .map_err(|e| e.to_string())?;
            pipeline
                .handle()
                .ok_or_else(|| "pipeline has no checkpoint loaded".to_string())?
        };

        // The snapshot now shows the active checkpoint
        {
            let state = self.shared.state.lock().await;
            self.shared.publish(&state).await;
        }

        let (progress_tx, mut progress_rx) = mpsc::channel::<GenerationProgress>(16);
        let generation = self.generator.execute(&handle, &task.params, progress_tx);
        tokio::pin!(generation);

        loop {
            tokio::select! {
                result = &mut generation => return result.map_err(|e| e.to_string()),
                Some(update) = progress_rx.recv() => {
                    let mut state = self.shared.state.lock().await;
                    state.progress = Some(update.fraction);
                    self.shared.publish(&state).await;
                }
            }
        }
    }
}
