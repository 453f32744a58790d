//! Testing utilities and mock implementations for E2E tests.
//!
//! This module provides mock implementations of the collaborator traits,
//! so the scheduler and the download manager can be exercised without a
//! GPU backend, a network or a populated model directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use sdhost_core::testing::{MockFetcher, MockGenerator, MockModelStore};
//!
//! let models = MockModelStore::with_models(&["A", "L1"]).await;
//! let generator = MockGenerator::new();
//! let fetcher = MockFetcher::new();
//!
//! // Configure mock behavior
//! generator.set_duration_ms(20).await;
//! fetcher.add_file("https://host/model.safetensors", vec![0u8; 4096]).await;
//!
//! // Wire them into a SchedulerCoordinator / DownloadManager...
//! ```

mod mock_fetcher;
mod mock_generator;
mod mock_model_store;

pub use mock_fetcher::{MockFetcher, RecordedFetch};
pub use mock_generator::{MockGenerator, RecordedGeneration};
pub use mock_model_store::MockModelStore;

/// Test fixtures and helper functions.
pub mod fixtures {
    use sha2::{Digest, Sha256};

    use crate::config::DownloadConfig;
    use crate::download::SourceDescriptor;
    use crate::task::GenerationRequest;

    /// A generation request with a prompt and the given adapters.
    pub fn generation_request(checkpoint: &str, adapters: &[(&str, f32)]) -> GenerationRequest {
        adapters.iter().fold(
            GenerationRequest::new(checkpoint).with_params(serde_json::json!({
                "prompt": format!("a watercolor of {}", checkpoint.to_lowercase()),
                "steps": 20,
            })),
            |request, (model, weight)| request.with_adapter(*model, *weight),
        )
    }

    /// Deterministic pseudo-random file content.
    pub fn file_content(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    /// Upper-case SHA-256 of some bytes.
    pub fn sha256_hex(content: &[u8]) -> String {
        format!("{:X}", Sha256::digest(content))
    }

    /// A source with its expected hash and size filled in from `content`.
    pub fn verified_source(url: &str, filename: &str, content: &[u8]) -> SourceDescriptor {
        let mut source = SourceDescriptor::new(url, filename)
            .with_sha256(sha256_hex(content))
            .with_size(content.len() as u64);
        source.model_name = Some("Fixture Model".to_string());
        source.version_name = Some("v1".to_string());
        source.model_kind = Some("checkpoint".to_string());
        source
    }

    /// Download settings tuned for fast tests: short backoff, and progress
    /// persisted on every chunk.
    pub fn fast_download_config() -> DownloadConfig {
        DownloadConfig {
            max_concurrent: 2,
            max_retries: 3,
            progress_interval_ms: 1,
            progress_bytes_threshold: 1,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 20,
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
            ..DownloadConfig::default()
        }
    }
}
