//! Mock generator for testing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::generator::{GenerationError, GenerationProgress, Generator};
use crate::pipeline::PipelineHandle;
use crate::task::AdapterSpec;

/// A recorded generation call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedGeneration {
    /// Checkpoint the pipeline had loaded.
    pub checkpoint: String,
    /// Adapters attached at the time of the call.
    pub adapters: Vec<AdapterSpec>,
    /// Parameters passed through from the task.
    pub params: serde_json::Value,
}

/// Mock implementation of the Generator trait.
///
/// Provides controllable behavior for testing:
/// - Record every call with the pipeline configuration it saw
/// - Fail the next call with a given error
/// - Hold calls until released, to observe a running task
/// - Emit progress updates
///
/// # Example
///
/// ```rust,ignore
/// use sdhost_core::testing::MockGenerator;
///
/// let generator = MockGenerator::new();
/// generator.hold().await;
///
/// // ... submit a task, observe it running ...
///
/// generator.release();
/// ```
#[derive(Debug)]
pub struct MockGenerator {
    /// Recorded calls.
    calls: Arc<RwLock<Vec<RecordedGeneration>>>,
    /// If set, the next call fails with this error.
    next_error: Arc<RwLock<Option<GenerationError>>>,
    /// Simulated generation duration.
    duration_ms: Arc<RwLock<u64>>,
    /// Progress steps reported per call (0 = none).
    progress_steps: Arc<RwLock<u32>>,
    /// Whether calls wait for `release`.
    held: Arc<RwLock<bool>>,
    release: Arc<Notify>,
    /// Number of calls currently inside `execute`.
    in_flight: Arc<RwLock<usize>>,
    /// Highest value `in_flight` ever reached.
    max_in_flight: Arc<RwLock<usize>>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerator {
    /// Create a new mock generator.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
            duration_ms: Arc::new(RwLock::new(0)),
            progress_steps: Arc::new(RwLock::new(0)),
            held: Arc::new(RwLock::new(false)),
            release: Arc::new(Notify::new()),
            in_flight: Arc::new(RwLock::new(0)),
            max_in_flight: Arc::new(RwLock::new(0)),
        }
    }

    /// Get all recorded calls.
    pub async fn recorded_calls(&self) -> Vec<RecordedGeneration> {
        self.calls.read().await.clone()
    }

    /// Get the number of calls made.
    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Configure the next call to fail with the given error.
    pub async fn set_next_error(&self, error: GenerationError) {
        *self.next_error.write().await = Some(error);
    }

    /// Set the simulated duration of every call.
    pub async fn set_duration_ms(&self, ms: u64) {
        *self.duration_ms.write().await = ms;
    }

    /// Emit this many progress updates per call.
    pub async fn set_progress_steps(&self, steps: u32) {
        *self.progress_steps.write().await = steps;
    }

    /// Make calls wait until [`release`](Self::release).
    pub async fn hold(&self) {
        *self.held.write().await = true;
    }

    /// Let one held call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Stop holding and let every waiting call finish.
    pub async fn release_all(&self) {
        *self.held.write().await = false;
        self.release.notify_waiters();
    }

    /// Highest number of concurrent calls observed.
    pub async fn max_in_flight(&self) -> usize {
        *self.max_in_flight.read().await
    }

    /// Wait until at least `n` calls were made.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.call_count().await >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.call_count().await >= n
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn execute(
        &self,
        pipeline: &PipelineHandle,
        params: &serde_json::Value,
        progress_tx: mpsc::Sender<GenerationProgress>,
    ) -> Result<serde_json::Value, GenerationError> {
        {
            let mut in_flight = self.in_flight.write().await;
            *in_flight += 1;
            let mut max = self.max_in_flight.write().await;
            *max = (*max).max(*in_flight);
        }

        self.calls.write().await.push(RecordedGeneration {
            checkpoint: pipeline.checkpoint.reference.clone(),
            adapters: pipeline.adapters.iter().map(|a| a.spec.clone()).collect(),
            params: params.clone(),
        });

        let steps = *self.progress_steps.read().await;
        for step in 1..=steps {
            let _ = progress_tx
                .send(GenerationProgress::from_steps(step, steps))
                .await;
        }

        if *self.held.read().await {
            self.release.notified().await;
        }

        let duration = *self.duration_ms.read().await;
        if duration > 0 {
            tokio::time::sleep(Duration::from_millis(duration)).await;
        }

        *self.in_flight.write().await -= 1;

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        Ok(serde_json::json!({
            "images": [format!("{}.png", pipeline.checkpoint.reference)],
            "params": params,
        }))
    }
}
