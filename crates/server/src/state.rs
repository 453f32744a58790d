use std::sync::Arc;

use sdhost_core::{Config, DownloadManager, SanitizedConfig, SchedulerCoordinator};

/// Components shared by the daemon's background loops
pub struct Daemon {
    config: Config,
    coordinator: Arc<SchedulerCoordinator>,
    downloads: Arc<DownloadManager>,
}

impl Daemon {
    pub fn new(
        config: Config,
        coordinator: Arc<SchedulerCoordinator>,
        downloads: Arc<DownloadManager>,
    ) -> Self {
        Self {
            config,
            coordinator,
            downloads,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn coordinator(&self) -> &SchedulerCoordinator {
        &self.coordinator
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }
}
