//! Types for model downloads.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::store::DownloadStoreError;

/// Status of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DownloadStatus::Pending),
            "downloading" => Some(DownloadStatus::Downloading),
            "paused" => Some(DownloadStatus::Paused),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "cancelled" => Some(DownloadStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal downloads only change through an explicit resume (failed)
    /// or a fresh submission (cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// States a cancel request applies to.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a model lives on a hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRef {
    /// Platform name, e.g. "civitai".
    pub platform: String,
    pub model_id: String,
    pub version_id: String,
}

/// What to fetch and what the result should look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    /// Remote file name; only its extension is used on disk.
    pub filename: String,
    /// SHA-256 of the artifact, when the platform publishes it.
    #[serde(default)]
    pub expected_sha256: Option<String>,
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub version_name: Option<String>,
    /// Kind of model, e.g. "checkpoint" or "lora".
    #[serde(default)]
    pub model_kind: Option<String>,
    #[serde(default)]
    pub platform: Option<PlatformRef>,
}

impl SourceDescriptor {
    /// A plain URL source with nothing known about the payload.
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            expected_sha256: None,
            expected_size: None,
            model_name: None,
            version_name: None,
            model_kind: None,
            platform: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Lower-case file extension including the dot, `.safetensors` when the
    /// file name has none.
    pub fn extension(&self) -> String {
        match self.filename.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && !ext.is_empty()
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                format!(".{}", ext.to_ascii_lowercase())
            }
            _ => ".safetensors".to_string(),
        }
    }

    /// Upper-case expected hash, if any.
    pub fn normalized_sha256(&self) -> Option<String> {
        self.expected_sha256
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| h.to_ascii_uppercase())
    }

    /// Reject sources that can never be downloaded.
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.url.trim().is_empty() {
            return Err(DownloadError::InvalidSource("url is empty".to_string()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(DownloadError::InvalidSource(format!(
                "unsupported url scheme: {}",
                self.url
            )));
        }
        if self.filename.trim().is_empty() {
            return Err(DownloadError::InvalidSource("filename is empty".to_string()));
        }
        if let Some(hash) = self.normalized_sha256() {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DownloadError::InvalidSource(format!(
                    "expected_sha256 is not a SHA-256 hex digest: {}",
                    hash
                )));
            }
        }
        Ok(())
    }
}

/// Identifier of the download for a source.
///
/// The expected content hash when known, so the id equals the model
/// reference; otherwise a hash of the url and file name.
pub fn download_id(source: &SourceDescriptor) -> String {
    if let Some(hash) = source.normalized_sha256() {
        return hash;
    }
    let mut hasher = Sha256::new();
    hasher.update(source.url.as_bytes());
    hasher.update(b"\n");
    hasher.update(source.filename.as_bytes());
    format!("{:X}", hasher.finalize())
}

/// A persisted download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub status: DownloadStatus,
    pub source: SourceDescriptor,
    /// Size of the remote file once known.
    pub total_bytes: Option<u64>,
    /// Bytes in the partial file.
    pub downloaded_bytes: u64,
    /// Bytes known to be flushed to disk; the next attempt starts here.
    pub resume_offset: u64,
    /// Consecutive transient failures.
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    /// Final artifact location, set on completion.
    pub file_path: Option<PathBuf>,
    /// Content hash of the finished artifact.
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    /// A new pending download for a source.
    pub fn new(source: SourceDescriptor, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: download_id(&source),
            status: DownloadStatus::Pending,
            total_bytes: source.expected_size,
            source,
            downloaded_bytes: 0,
            resume_offset: 0,
            retry_count: 0,
            max_retries,
            error: None,
            file_path: None,
            sha256: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Completed fraction, when the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some((self.downloaded_bytes as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Verbs accepted by [`DownloadManager::action`](super::DownloadManager::action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    Pause,
    Resume,
    Cancel,
    Remove,
}

impl DownloadAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadAction::Pause => "pause",
            DownloadAction::Resume => "resume",
            DownloadAction::Cancel => "cancel",
            DownloadAction::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pause" => Some(DownloadAction::Pause),
            "resume" => Some(DownloadAction::Resume),
            "cancel" => Some(DownloadAction::Cancel),
            "remove" => Some(DownloadAction::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one download as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: String,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Average speed of the current attempt.
    pub speed_bps: Option<u64>,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
    /// Reference of the registered artifact once completed.
    pub reference: Option<String>,
}

impl DownloadSnapshot {
    /// Snapshot of a record with no live transfer figures.
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            downloaded_bytes: task.downloaded_bytes,
            total_bytes: task.total_bytes,
            speed_bps: None,
            eta_secs: None,
            error: task.error.clone(),
            reference: task.sha256.clone(),
        }
    }

    pub fn with_rate(mut self, speed_bps: u64, eta_secs: Option<u64>) -> Self {
        self.speed_bps = Some(speed_bps);
        self.eta_secs = eta_secs;
        self
    }
}

/// Errors returned by download manager operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadError {
    #[error("not found")]
    NotFound(String),

    #[error("cannot {action} download in status {status}")]
    InvalidState {
        id: String,
        status: DownloadStatus,
        action: DownloadAction,
    },

    #[error("invalid download source: {0}")]
    InvalidSource(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("failed to register artifact: {0}")]
    Registration(String),

    #[error("download manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] DownloadStoreError),

    #[error("I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_status_roundtrip_and_classes() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
        ] {
            assert_eq!(DownloadStatus::parse(status.as_str()), Some(status));
            assert_ne!(status.is_terminal(), status.is_active());
        }
        assert_eq!(DownloadStatus::parse("stalled"), None);
    }

    #[test]
    fn test_id_uses_expected_hash_upper_case() {
        let source = SourceDescriptor::new("https://x/y", "model.safetensors").with_sha256(HASH);
        assert_eq!(download_id(&source), HASH.to_ascii_uppercase());
    }

    #[test]
    fn test_id_without_hash_is_deterministic() {
        let a = SourceDescriptor::new("https://x/y", "model.safetensors");
        let b = SourceDescriptor::new("https://x/y", "model.safetensors");
        let c = SourceDescriptor::new("https://x/z", "model.safetensors");

        assert_eq!(download_id(&a), download_id(&b));
        assert_ne!(download_id(&a), download_id(&c));
        assert_eq!(download_id(&a).len(), 64);
    }

    #[test]
    fn test_extension() {
        assert_eq!(SourceDescriptor::new("https://x", "a.SafeTensors").extension(), ".safetensors");
        assert_eq!(SourceDescriptor::new("https://x", "a.ckpt").extension(), ".ckpt");
        assert_eq!(SourceDescriptor::new("https://x", "noext").extension(), ".safetensors");
        assert_eq!(SourceDescriptor::new("https://x", ".hidden").extension(), ".safetensors");
    }

    #[test]
    fn test_validate() {
        assert!(SourceDescriptor::new("https://x/y", "a.safetensors").validate().is_ok());
        assert!(SourceDescriptor::new("", "a.safetensors").validate().is_err());
        assert!(SourceDescriptor::new("ftp://x/y", "a.safetensors").validate().is_err());
        assert!(SourceDescriptor::new("https://x/y", " ").validate().is_err());
        assert!(SourceDescriptor::new("https://x/y", "a.safetensors")
            .with_sha256("abc")
            .validate()
            .is_err());
    }

    #[test]
    fn test_new_task_takes_expected_size() {
        let source = SourceDescriptor::new("https://x/y", "a.safetensors").with_size(100);
        let task = DownloadTask::new(source, 3, Utc::now());
        assert_eq!(task.status, DownloadStatus::Pending);
        assert_eq!(task.total_bytes, Some(100));
        assert_eq!(task.fraction(), Some(0.0));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(DownloadError::NotFound("x".into()).to_string(), "not found");
        let err = DownloadError::InvalidState {
            id: "x".into(),
            status: DownloadStatus::Completed,
            action: DownloadAction::Pause,
        };
        assert_eq!(err.to_string(), "cannot pause download in status completed");
    }
}
