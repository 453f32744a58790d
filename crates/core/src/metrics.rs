//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Scheduler (task lifecycle, durations)
//! - Pipeline (checkpoint reloads, adapter loads)
//! - Downloads (lifecycle, bytes, retries)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Tasks by lifecycle event.
pub static TASKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("sdhost_tasks_total", "Generation tasks by lifecycle event"),
        &["event"], // "submitted", "completed", "failed", "cancelled", "promoted"
    )
    .unwrap()
});

/// Time from task start to its terminal status.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "sdhost_task_duration_seconds",
            "Duration of generation tasks",
        )
        .buckets(vec![1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Pipeline Metrics
// =============================================================================

/// Checkpoint loads into the pipeline.
pub static CHECKPOINT_RELOADS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "sdhost_checkpoint_reloads_total",
        "Checkpoint loads performed by the pipeline",
    )
    .unwrap()
});

/// Adapter loads by kind of change.
pub static ADAPTER_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sdhost_adapter_changes_total",
            "Adapter changes applied to the pipeline",
        ),
        &["kind"], // "loaded", "reweighted"
    )
    .unwrap()
});

// =============================================================================
// Download Metrics
// =============================================================================

/// Download lifecycle events.
pub static DOWNLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("sdhost_downloads_total", "Downloads by lifecycle event"),
        &["event"], // "started", "completed", "failed", "cancelled", "paused"
    )
    .unwrap()
});

/// Bytes written to disk by downloads.
pub static BYTES_DOWNLOADED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "sdhost_download_bytes_total",
        "Bytes written by model downloads",
    )
    .unwrap()
});

/// Automatic download retries by error class.
pub static DOWNLOAD_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "sdhost_download_retries_total",
            "Automatic download retries after transient errors",
        ),
        &["kind"], // "timeout", "throttled", "connection", "http_5xx", "short_read"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Scheduler
        Box::new(TASKS_TOTAL.clone()),
        Box::new(TASK_DURATION.clone()),
        // Pipeline
        Box::new(CHECKPOINT_RELOADS.clone()),
        Box::new(ADAPTER_CHANGES.clone()),
        // Downloads
        Box::new(DOWNLOADS_TOTAL.clone()),
        Box::new(BYTES_DOWNLOADED.clone()),
        Box::new(DOWNLOAD_RETRIES.clone()),
    ]
}

/// Register all core metrics in `registry`.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    for metric in all_metrics() {
        registry.register(metric)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_once() {
        let registry = Registry::new();
        register_metrics(&registry).unwrap();

        TASKS_TOTAL.with_label_values(&["submitted"]).inc();
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"sdhost_tasks_total".to_string()));

        // Registering the same collectors twice is rejected.
        assert!(register_metrics(&registry).is_err());
    }
}
