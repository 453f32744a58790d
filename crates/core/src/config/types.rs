use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
    #[serde(default)]
    pub civitai: CivitaiConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("sdhost.db")
}

/// Model storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding content-addressed model artifacts.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// File extensions recognized as model artifacts.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_allowed_extensions() -> Vec<String> {
    [".safetensors", ".ckpt", ".pt", ".bin", ".pth"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Generation scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// When disabled the executor loop is not started; tasks only queue up.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of recent task durations averaged for the running task ETA.
    #[serde(default = "default_eta_window")]
    pub eta_window: usize,
    /// Buffer size of each snapshot broadcast channel.
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            eta_window: default_eta_window(),
            snapshot_capacity: default_snapshot_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_eta_window() -> usize {
    10
}

fn default_snapshot_capacity() -> usize {
    64
}

/// Download manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    /// Maximum simultaneous transfers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Consecutive transient failures tolerated before a download fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Minimum time between persisted progress updates.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    /// Bytes received that force a progress update regardless of time.
    #[serde(default = "default_progress_bytes")]
    pub progress_bytes_threshold: u64,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum silence on an open connection before the attempt is dropped.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            progress_interval_ms: default_progress_interval(),
            progress_bytes_threshold: default_progress_bytes(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_progress_interval() -> u64 {
    1000 // 1 second
}

fn default_progress_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("sdhost/{}", env!("CARGO_PKG_VERSION"))
}

/// Civitai API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CivitaiConfig {
    #[serde(default = "default_civitai_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl Default for CivitaiConfig {
    fn default() -> Self {
        Self {
            base_url: default_civitai_url(),
            api_key: None,
            timeout_secs: default_api_timeout(),
        }
    }
}

fn default_civitai_url() -> String {
    "https://civitai.com/api/v1".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

/// Outbound proxy configuration.
///
/// Unset entries fall back to the `HTTP_PROXY`/`HTTPS_PROXY` environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub https: Option<String>,
}

/// Inference backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generator_endpoint(),
            timeout_secs: default_generator_timeout(),
        }
    }
}

fn default_generator_endpoint() -> String {
    "http://127.0.0.1:7860/generate".to_string()
}

fn default_generator_timeout() -> u64 {
    600
}

/// Sanitized config for logging and API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub downloads: DownloadConfig,
    pub civitai: SanitizedCivitaiConfig,
    pub proxy: ProxyConfig,
    pub generator: GeneratorConfig,
}

/// Sanitized Civitai config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCivitaiConfig {
    pub base_url: String,
    pub api_key_configured: bool,
    pub timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            storage: config.storage.clone(),
            scheduler: config.scheduler.clone(),
            downloads: config.downloads.clone(),
            civitai: SanitizedCivitaiConfig {
                base_url: config.civitai.base_url.clone(),
                api_key_configured: config
                    .civitai
                    .api_key
                    .as_ref()
                    .is_some_and(|k| !k.is_empty()),
                timeout_secs: config.civitai.timeout_secs,
            },
            proxy: config.proxy.clone(),
            generator: config.generator.clone(),
        }
    }
}
