pub mod batch;
pub mod config;
pub mod download;
pub mod generator;
pub mod metrics;
pub mod model_store;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod testing;

pub use batch::{BatchFailure, BatchItem, BatchResult};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use download::{
    download_id, BatchActionOutcome, CivitaiClient, DownloadAction, DownloadError,
    DownloadManager, DownloadSnapshot, DownloadStatus, DownloadStore, DownloadTask, Fetcher,
    HttpFetcher, SourceDescriptor, SqliteDownloadStore,
};
pub use generator::{GenerationError, GenerationProgress, Generator, HttpGenerator};
pub use model_store::{FsModelStore, ModelHandle, ModelStore, ModelStoreError};
pub use pipeline::{PipelineManager, PipelineState, SqlitePipelineStore};
pub use progress::{ProgressBroadcaster, ProgressEvent, SharedBroadcaster};
pub use scheduler::{QueueSnapshot, SchedulerCoordinator, SchedulerError, SubmitReceipt};
pub use task::{AdapterMode, AdapterSpec, GenerationRequest, SqliteTaskStore, Task, TaskStatus};
