//! Prometheus metrics for the daemon.
//!
//! The registry carries the core counters plus gauges sampled from the
//! running components:
//! - Queue depth and the running task
//! - Downloads per status and live download workers
//!
//! The daemon has no scrape endpoint; the sampler logs the encoded
//! registry at debug level on every tick.

use once_cell::sync::Lazy;
use prometheus::{self, Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use sdhost_core::DownloadStatus;

use crate::state::Daemon;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Scheduler Gauges
// =============================================================================

/// Pending generation tasks.
pub static QUEUE_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("sdhost_queue_pending", "Number of pending generation tasks").unwrap()
});

/// 1 while a task holds the GPU.
pub static TASK_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("sdhost_task_running", "Whether a generation task is running").unwrap()
});

// =============================================================================
// Download Gauges
// =============================================================================

/// Download records by status.
pub static DOWNLOADS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("sdhost_downloads", "Download records by status"),
        &["status"],
    )
    .unwrap()
});

pub static DOWNLOAD_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("sdhost_download_workers", "Live download workers").unwrap()
});

fn register_metrics(registry: &Registry) {
    sdhost_core::metrics::register_metrics(registry).unwrap();

    registry.register(Box::new(QUEUE_PENDING.clone())).unwrap();
    registry.register(Box::new(TASK_RUNNING.clone())).unwrap();
    registry.register(Box::new(DOWNLOADS_BY_STATUS.clone())).unwrap();
    registry.register(Box::new(DOWNLOAD_WORKERS.clone())).unwrap();
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Sample the gauges from the running components.
pub async fn collect_dynamic_metrics(daemon: &Daemon) {
    let snapshot = daemon.coordinator().snapshot().await;
    QUEUE_PENDING.set(snapshot.queue_length as i64);
    TASK_RUNNING.set(i64::from(snapshot.running.is_some()));

    match daemon.downloads().list(None).await {
        Ok(downloads) => {
            for status in [
                DownloadStatus::Pending,
                DownloadStatus::Downloading,
                DownloadStatus::Paused,
                DownloadStatus::Completed,
                DownloadStatus::Failed,
                DownloadStatus::Cancelled,
            ] {
                let count = downloads.iter().filter(|d| d.status == status).count();
                DOWNLOADS_BY_STATUS
                    .with_label_values(&[status.as_str()])
                    .set(count as i64);
            }
        }
        Err(e) => tracing::warn!("Failed to list downloads for metrics: {}", e),
    }
    DOWNLOAD_WORKERS.set(daemon.downloads().active_workers() as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        QUEUE_PENDING.set(3);
        let output = encode_metrics();

        assert!(output.contains("# HELP sdhost_queue_pending"));
        assert!(output.contains("# TYPE sdhost_queue_pending gauge"));
        assert!(output.contains("sdhost_queue_pending 3"));
    }

    #[test]
    fn test_encoded_registry_carries_sampled_gauges() {
        DOWNLOAD_WORKERS.set(2);
        DOWNLOADS_BY_STATUS.with_label_values(&["failed"]).set(1);

        let output = encode_metrics();
        assert!(output.contains("sdhost_download_workers 2"));
        assert!(output.contains("sdhost_downloads{status=\"failed\"} 1"));
    }

    #[test]
    fn test_registry_contains_core_and_daemon_metrics() {
        sdhost_core::metrics::TASKS_TOTAL
            .with_label_values(&["submitted"])
            .inc();
        DOWNLOADS_BY_STATUS.with_label_values(&["paused"]).set(0);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        for expected in [
            "sdhost_tasks_total",
            "sdhost_queue_pending",
            "sdhost_task_running",
            "sdhost_downloads",
            "sdhost_download_workers",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
    }
}
