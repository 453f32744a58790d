//! Resumable model downloads.
//!
//! A download is identified by the content hash of its artifact (or of
//! its source when the hash is unknown), which makes submission
//! idempotent. Transfers continue from the last flushed byte after a
//! pause, a transient error or a restart, and finished artifacts are
//! verified and registered with the model store.

pub mod civitai;
mod fetcher;
mod manager;
pub mod retry;
mod sqlite_store;
mod store;
mod throttle;
mod types;
mod worker;

pub use civitai::{CivitaiClient, CivitaiError};
pub use fetcher::{FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use manager::{BatchActionOutcome, DownloadManager};
pub use sqlite_store::SqliteDownloadStore;
pub use store::{DownloadStore, DownloadStoreError};
pub use throttle::{eta_secs, ProgressThrottle, TransferRate};
pub use types::{
    download_id, DownloadAction, DownloadError, DownloadSnapshot, DownloadStatus, DownloadTask,
    PlatformRef, SourceDescriptor,
};
