mod metrics;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sdhost_core::{
    load_config, validate_config, DownloadManager, DownloadStore, FsModelStore, Generator,
    HttpFetcher, HttpGenerator, ModelStore, ProgressBroadcaster, SanitizedConfig,
    SchedulerCoordinator, SharedBroadcaster, SqliteDownloadStore, SqlitePipelineStore,
    SqliteTaskStore,
};

use state::Daemon;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often gauges are sampled.
const METRICS_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("SDHOST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    // Short hash of the sanitized config
    let sanitized = SanitizedConfig::from(&config);
    let config_json = serde_json::to_string(&sanitized).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Configuration loaded successfully"
    );
    info!("Database path: {:?}", config.database.path);
    info!("Models directory: {:?}", config.storage.models_dir);

    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    tokio::fs::create_dir_all(&config.storage.models_dir)
        .await
        .with_context(|| format!("Failed to create {:?}", config.storage.models_dir))?;

    // Create SQLite stores
    let task_store = Arc::new(
        SqliteTaskStore::new(&config.database.path).context("Failed to create task store")?,
    );
    let pipeline_store = Arc::new(
        SqlitePipelineStore::new(&config.database.path)
            .context("Failed to create pipeline store")?,
    );
    let download_store: Arc<dyn DownloadStore> = Arc::new(
        SqliteDownloadStore::new(&config.database.path)
            .context("Failed to create download store")?,
    );
    info!("Stores initialized");

    let models: Arc<dyn ModelStore> = Arc::new(FsModelStore::new(
        config.storage.models_dir.clone(),
        config.storage.allowed_extensions.clone(),
    ));

    let progress: SharedBroadcaster =
        Arc::new(ProgressBroadcaster::new(config.scheduler.snapshot_capacity));

    // Create download manager
    let mut fetcher = HttpFetcher::new(&config.downloads, &config.proxy)
        .context("Failed to create HTTP fetcher")?;
    if let Some(api_key) = &config.civitai.api_key {
        fetcher = fetcher
            .with_bearer_token(&config.civitai.base_url, api_key)
            .context("Invalid Civitai base URL")?;
        info!("Civitai API key configured");
    }

    let downloads = Arc::new(DownloadManager::new(
        config.downloads.clone(),
        config.storage.models_dir.clone(),
        download_store,
        Arc::new(fetcher),
        Arc::clone(&models),
        Arc::clone(&progress),
    ));
    let restarted = downloads
        .recover()
        .await
        .context("Failed to recover downloads")?;
    info!(restarted, "Download manager started");

    // Create scheduler
    let generator: Arc<dyn Generator> = Arc::new(
        HttpGenerator::new(&config.generator).context("Failed to create generator client")?,
    );
    info!("Using generator at {}", config.generator.endpoint);

    let coordinator = Arc::new(SchedulerCoordinator::new(
        config.scheduler.clone(),
        task_store,
        models,
        pipeline_store,
        generator,
        progress,
    ));
    coordinator
        .start()
        .await
        .context("Failed to start scheduler")?;

    let daemon = Arc::new(Daemon::new(config, coordinator, downloads));
    debug!(config = ?daemon.sanitized_config(), "Effective configuration");

    // Force registration before the first sample
    once_cell::sync::Lazy::force(&metrics::REGISTRY);

    let background = [
        spawn_queue_logger(Arc::clone(&daemon)),
        spawn_metrics_sampler(Arc::clone(&daemon)),
    ];

    info!("sdhost {} running", VERSION);
    shutdown_signal().await;
    info!("Shutting down...");

    for handle in &background {
        handle.abort();
    }

    daemon.coordinator().stop().await;
    daemon.downloads().shutdown().await;
    debug!("Final metrics:\n{}", metrics::encode_metrics());

    info!("Shutdown complete");
    Ok(())
}

/// Log every queue snapshot.
fn spawn_queue_logger(daemon: Arc<Daemon>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut snapshots = daemon.coordinator().subscribe().await;
        while let Some(snapshot) = snapshots.next().await {
            match &snapshot.running {
                Some(running) => info!(
                    queue_length = snapshot.queue_length,
                    running = %running.id,
                    checkpoint = %running.checkpoint,
                    progress = ?running.progress,
                    eta_secs = ?running.eta_secs,
                    "Queue updated"
                ),
                None => info!(
                    queue_length = snapshot.queue_length,
                    active_checkpoint = ?snapshot.active_checkpoint,
                    "Queue updated"
                ),
            }
        }
    })
}

/// Periodically refresh the gauges and log the registry.
fn spawn_metrics_sampler(daemon: Arc<Daemon>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_INTERVAL);
        loop {
            interval.tick().await;
            metrics::collect_dynamic_metrics(&daemon).await;
            debug!("Metrics:\n{}", metrics::encode_metrics());
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
