//! Download storage trait.

use thiserror::Error;

use super::{DownloadStatus, DownloadTask};

/// Error type for download persistence.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadStoreError {
    #[error("Download not found: {0}")]
    NotFound(String),

    #[error("Download already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Trait for download storage backends.
///
/// Each call is a single statement, so a record is never observed half
/// written. Callers serialize writes per id.
pub trait DownloadStore: Send + Sync {
    /// Persist a new download.
    fn insert(&self, task: &DownloadTask) -> Result<(), DownloadStoreError>;

    /// Get a download by ID.
    fn get(&self, id: &str) -> Result<Option<DownloadTask>, DownloadStoreError>;

    /// List downloads, optionally restricted to one status, oldest first.
    fn list(&self, status: Option<DownloadStatus>) -> Result<Vec<DownloadTask>, DownloadStoreError>;

    /// Overwrite an existing record.
    fn update(&self, task: &DownloadTask) -> Result<(), DownloadStoreError>;

    /// Replace whatever is stored under the task's id.
    fn replace(&self, task: &DownloadTask) -> Result<(), DownloadStoreError>;

    /// Delete a record. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool, DownloadStoreError>;

    /// Delete every record in a terminal status and return them.
    fn delete_terminal(&self) -> Result<Vec<DownloadTask>, DownloadStoreError>;
}
