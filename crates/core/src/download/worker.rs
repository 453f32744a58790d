//! The transfer loop behind one download.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::fetcher::FetchError;
use super::manager::{discard_partial, Shared};
use super::retry::{ErrorKind, RetryDecision, RetryPolicy};
use super::throttle::{eta_secs, ProgressThrottle, TransferRate};
use super::{DownloadError, DownloadSnapshot, DownloadStatus, DownloadTask};
use crate::metrics;
use crate::model_store::RegisteredArtifact;

/// Requests sent from the manager to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Control {
    Run,
    Pause,
    Cancel,
    /// Stop without changing the status, for recovery on next start.
    Shutdown,
}

enum Attempt {
    /// The body was fully received.
    Finished,
    Interrupted(Control),
    Failed {
        error: String,
        kind: ErrorKind,
        /// Whether this attempt wrote any bytes.
        progressed: bool,
    },
}

/// Wait for a request other than `Run`. A dropped manager means shutdown.
async fn next_signal(control: &mut watch::Receiver<Control>) -> Control {
    loop {
        let current = *control.borrow_and_update();
        if current != Control::Run {
            return current;
        }
        if control.changed().await.is_err() {
            return Control::Shutdown;
        }
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:X}", hasher.finalize()))
}

/// Runs one download from its persisted offset to a final status, or until
/// the manager asks it to stop.
pub(super) struct Worker {
    shared: Arc<Shared>,
    id: String,
    generation: u64,
    control: watch::Receiver<Control>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        id: String,
        generation: u64,
        control: watch::Receiver<Control>,
    ) -> Self {
        Self {
            shared,
            id,
            generation,
            control,
        }
    }

    pub(super) async fn run(mut self) {
        if let Err(e) = self.drive().await {
            error!(download_id = %self.id, "Download worker stopped: {}", e);
        }
        self.shared.forget_worker(&self.id, self.generation);
    }

    async fn drive(&mut self) -> Result<(), DownloadError> {
        let Some(mut task) = self.shared.store.get(&self.id)? else {
            warn!(download_id = %self.id, "Download vanished before it started");
            return Ok(());
        };

        let permits = Arc::clone(&self.shared.permits);
        let _permit = tokio::select! {
            signal = next_signal(&mut self.control) => return self.stop(task, signal).await,
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        let now = Utc::now();
        task.status = DownloadStatus::Downloading;
        task.started_at.get_or_insert(now);
        self.shared.save(&mut task)?;
        self.shared.publish_task(&task);
        metrics::DOWNLOADS_TOTAL.with_label_values(&["started"]).inc();
        info!(download_id = %self.id, offset = task.resume_offset, "Download started");

        loop {
            let attempt = match self.attempt(&mut task).await {
                Ok(attempt) => attempt,
                // Local I/O trouble is not something a retry fixes
                Err(e) => Attempt::Failed {
                    error: e.to_string(),
                    kind: ErrorKind::Permanent,
                    progressed: false,
                },
            };

            match attempt {
                Attempt::Finished => {
                    if let Err(e) = self.finish(&mut task).await {
                        self.fail(&mut task, e.to_string())?;
                    }
                    return Ok(());
                }
                Attempt::Interrupted(signal) => return self.stop(task, signal).await,
                Attempt::Failed {
                    error,
                    kind,
                    progressed,
                } => {
                    if progressed {
                        task.retry_count = 0;
                    }
                    task.retry_count += 1;
                    task.error = Some(error);

                    let policy = RetryPolicy {
                        max_retries: task.max_retries,
                        ..self.shared.retry
                    };
                    match policy.decide(task.retry_count, kind) {
                        RetryDecision::NoRetry => {
                            let error = task.error.clone().unwrap_or_default();
                            return self.fail(&mut task, error);
                        }
                        RetryDecision::RetryAfter(delay) => {
                            metrics::DOWNLOAD_RETRIES
                                .with_label_values(&[kind.label()])
                                .inc();
                            warn!(
                                download_id = %self.id,
                                retry = task.retry_count,
                                max_retries = task.max_retries,
                                delay_ms = delay.as_millis() as u64,
                                "Transfer failed, retrying: {}",
                                task.error.as_deref().unwrap_or_default()
                            );
                            self.shared.save(&mut task)?;
                            self.shared.publish_task(&task);

                            tokio::select! {
                                signal = next_signal(&mut self.control) => return self.stop(task, signal).await,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// One request, from the persisted offset to the end of the body.
    async fn attempt(&mut self, task: &mut DownloadTask) -> Result<Attempt, DownloadError> {
        let part = self.shared.partial_path(task);
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Io(format!("{}: {}", parent.display(), e)))?;
        }

        // Never trust more than what is both persisted and on disk
        let on_disk = match fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(DownloadError::Io(format!("{}: {}", part.display(), e))),
        };
        let mut offset = task.resume_offset.min(on_disk);

        let fetched = tokio::select! {
            signal = next_signal(&mut self.control) => {
                Self::rewind(task, offset);
                return Ok(Attempt::Interrupted(signal));
            }
            fetched = self.shared.fetcher.fetch(&task.source.url, offset) => fetched,
        };

        let response = match fetched {
            Ok(response) => response,
            // Requested range starts at the end: the file is already whole
            Err(FetchError::Status { status: 416, .. })
                if offset > 0 && task.total_bytes.map_or(true, |total| offset >= total) =>
            {
                Self::rewind(task, offset);
                return Ok(Attempt::Finished);
            }
            Err(e) => {
                Self::rewind(task, offset);
                return Ok(Attempt::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                    progressed: false,
                });
            }
        };

        if offset > 0 && !response.resumed {
            info!(download_id = %self.id, offset, "Server ignored the range request, restarting from zero");
            offset = 0;
        }

        let mut file = Self::open_partial(&part, offset).await?;
        Self::rewind(task, offset);
        if response.total_size.is_some() {
            task.total_bytes = response.total_size;
        }
        self.shared.save(task)?;
        self.shared.publish_task(task);
        debug!(download_id = %self.id, offset, total = ?task.total_bytes, "Transfer open");

        let started = Instant::now();
        let rate = TransferRate::starting_at(started);
        let mut throttle = ProgressThrottle::starting_at(
            Duration::from_millis(self.shared.config.progress_interval_ms),
            self.shared.config.progress_bytes_threshold,
            started,
        );
        let read_timeout = Duration::from_secs(self.shared.config.read_timeout_secs);
        let mut received: u64 = 0;
        let mut body = response.body;

        loop {
            let next = tokio::select! {
                signal = next_signal(&mut self.control) => {
                    self.checkpoint(&mut file, task).await?;
                    return Ok(Attempt::Interrupted(signal));
                }
                next = tokio::time::timeout(read_timeout, body.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    self.checkpoint(&mut file, task).await?;
                    return Ok(Attempt::Failed {
                        kind: e.kind(),
                        error: e.to_string(),
                        progressed: received > 0,
                    });
                }
                Err(_) => {
                    self.checkpoint(&mut file, task).await?;
                    return Ok(Attempt::Failed {
                        kind: ErrorKind::Timeout,
                        error: format!("no data received for {}s", read_timeout.as_secs()),
                        progressed: received > 0,
                    });
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::Io(format!("{}: {}", part.display(), e)))?;

            let len = chunk.len() as u64;
            received += len;
            task.downloaded_bytes += len;
            metrics::BYTES_DOWNLOADED.inc_by(len);
            // The announced size was an estimate
            if task.total_bytes.is_some_and(|total| task.downloaded_bytes > total) {
                task.total_bytes = Some(task.downloaded_bytes);
            }

            let now = Instant::now();
            if throttle.record(len, now) {
                self.checkpoint(&mut file, task).await?;
                let speed = rate.speed_bps(received, now);
                let remaining = task
                    .total_bytes
                    .map(|total| total.saturating_sub(task.downloaded_bytes));
                self.shared.publish(
                    DownloadSnapshot::from_task(task).with_rate(speed, eta_secs(remaining, speed)),
                );
            }
        }

        Self::persist_bytes(&mut file)
            .await
            .map_err(|e| DownloadError::Io(format!("{}: {}", part.display(), e)))?;
        task.resume_offset = task.downloaded_bytes;

        if let Some(total) = response.total_size {
            if task.downloaded_bytes < total {
                if let Err(e) = self.shared.save(task) {
                    warn!(download_id = %self.id, "Failed to persist short transfer: {}", e);
                }
                return Ok(Attempt::Failed {
                    kind: ErrorKind::ShortRead,
                    error: format!(
                        "transfer ended at {} of {} bytes",
                        task.downloaded_bytes, total
                    ),
                    progressed: received > 0,
                });
            }
        }

        Ok(Attempt::Finished)
    }

    /// Open the partial file truncated to `offset`, positioned at its end.
    async fn open_partial(path: &Path, offset: u64) -> Result<File, DownloadError> {
        let io_err = |e: std::io::Error| DownloadError::Io(format!("{}: {}", path.display(), e));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(io_err)?;
        file.set_len(offset).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        Ok(file)
    }

    fn rewind(task: &mut DownloadTask, offset: u64) {
        task.downloaded_bytes = offset;
        task.resume_offset = offset;
    }

    /// Flush what was written and persist it as the resume offset.
    async fn checkpoint(&self, file: &mut File, task: &mut DownloadTask) -> Result<(), DownloadError> {
        Self::persist_bytes(file)
            .await
            .map_err(|e| DownloadError::Io(e.to_string()))?;
        task.resume_offset = task.downloaded_bytes;
        if let Err(e) = self.shared.save(task) {
            // The next checkpoint will catch up
            warn!(download_id = %self.id, "Failed to persist download progress: {}", e);
        }
        Ok(())
    }

    /// Flush buffered writes and wait for the data to reach the disk, so a
    /// recorded `resume_offset` never runs ahead of the partial file.
    async fn persist_bytes(file: &mut File) -> std::io::Result<()> {
        file.flush().await?;
        file.sync_data().await
    }

    /// Verify, move into place and register the finished artifact.
    async fn finish(&self, task: &mut DownloadTask) -> Result<(), DownloadError> {
        let part = self.shared.partial_path(task);

        let digest = {
            let path = part.clone();
            tokio::task::spawn_blocking(move || hash_file(&path))
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))?
                .map_err(|e| DownloadError::Io(format!("{}: {}", part.display(), e)))?
        };

        if let Some(expected) = task.source.normalized_sha256() {
            if digest != expected {
                discard_partial(&part).await;
                Self::rewind(task, 0);
                return Err(DownloadError::HashMismatch {
                    expected,
                    actual: digest,
                });
            }
        }

        let final_path: PathBuf = self
            .shared
            .models_dir
            .join(format!("{}{}", digest, task.source.extension()));
        fs::rename(&part, &final_path)
            .await
            .map_err(|e| DownloadError::Io(format!("{}: {}", final_path.display(), e)))?;

        let artifact = RegisteredArtifact {
            reference: digest.clone(),
            path: final_path.clone(),
            size_bytes: task.downloaded_bytes,
            model_name: task.source.model_name.clone(),
            version_name: task.source.version_name.clone(),
            model_kind: task.source.model_kind.clone(),
            source_url: task.source.url.clone(),
        };
        self.shared
            .models
            .register(&artifact)
            .await
            .map_err(|e| DownloadError::Registration(e.to_string()))?;

        task.status = DownloadStatus::Completed;
        task.total_bytes = Some(task.downloaded_bytes);
        task.error = None;
        task.file_path = Some(final_path);
        task.sha256 = Some(digest);
        task.completed_at = Some(Utc::now());
        self.shared.save(task)?;
        self.shared.publish_task(task);

        metrics::DOWNLOADS_TOTAL.with_label_values(&["completed"]).inc();
        info!(download_id = %self.id, bytes = task.downloaded_bytes, "Download completed");
        Ok(())
    }

    fn fail(&self, task: &mut DownloadTask, error: String) -> Result<(), DownloadError> {
        warn!(download_id = %self.id, "Download failed: {}", error);
        task.status = DownloadStatus::Failed;
        task.error = Some(error);
        task.completed_at = Some(Utc::now());
        self.shared.save(task)?;
        self.shared.publish_task(task);
        metrics::DOWNLOADS_TOTAL.with_label_values(&["failed"]).inc();
        Ok(())
    }

    /// Leave the transfer as the manager asked.
    async fn stop(&self, mut task: DownloadTask, signal: Control) -> Result<(), DownloadError> {
        match signal {
            Control::Pause => {
                task.status = DownloadStatus::Paused;
                task.downloaded_bytes = task.resume_offset;
                self.shared.save(&mut task)?;
                self.shared.publish_task(&task);
                metrics::DOWNLOADS_TOTAL.with_label_values(&["paused"]).inc();
                info!(download_id = %self.id, offset = task.resume_offset, "Download paused");
            }
            Control::Cancel => {
                discard_partial(&self.shared.partial_path(&task)).await;
                Self::rewind(&mut task, 0);
                task.status = DownloadStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                self.shared.save(&mut task)?;
                self.shared.publish_task(&task);
                metrics::DOWNLOADS_TOTAL.with_label_values(&["cancelled"]).inc();
                info!(download_id = %self.id, "Download cancelled");
            }
            Control::Shutdown | Control::Run => {
                task.downloaded_bytes = task.resume_offset;
                self.shared.save(&mut task)?;
                debug!(download_id = %self.id, offset = task.resume_offset, "Download worker shut down");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_signal_skips_run() {
        let (tx, mut rx) = watch::channel(Control::Run);
        let waiter = tokio::spawn(async move { next_signal(&mut rx).await });

        tx.send(Control::Run).unwrap();
        tx.send(Control::Pause).unwrap();
        assert_eq!(waiter.await.unwrap(), Control::Pause);
    }

    #[tokio::test]
    async fn test_next_signal_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(Control::Run);
        drop(tx);
        assert_eq!(next_signal(&mut rx).await, Control::Shutdown);
    }

    #[test]
    fn test_hash_file_is_upper_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"test").unwrap();

        assert_eq!(
            hash_file(&path).unwrap(),
            "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08"
        );
    }
}
