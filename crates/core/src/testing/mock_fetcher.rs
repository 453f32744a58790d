//! Mock fetcher for testing.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::download::{FetchError, FetchResponse, Fetcher};

/// A recorded fetch for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFetch {
    pub url: String,
    /// Offset the caller asked to continue from.
    pub offset: u64,
}

/// Mock implementation of the Fetcher trait.
///
/// Provides controllable behavior for testing:
/// - Serve in-memory files, in chunks, optionally slowly
/// - Fail the next fetches, or cut the next body short
/// - Ignore range requests, like a server without resume support
/// - Count every byte handed out
///
/// # Example
///
/// ```rust,ignore
/// use sdhost_core::testing::MockFetcher;
///
/// let fetcher = MockFetcher::new();
/// fetcher.add_file("https://host/model.safetensors", vec![7u8; 4096]).await;
/// fetcher.fail_next(FetchError::Connection("reset".into())).await;
///
/// // ... run a download ...
///
/// assert_eq!(fetcher.fetch_count().await, 2);
/// ```
#[derive(Debug)]
pub struct MockFetcher {
    /// File contents by URL.
    files: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    /// Errors returned by the next fetches, in order.
    failures: Arc<RwLock<VecDeque<FetchError>>>,
    /// If set, the next body fails after this many bytes.
    cut_after: Arc<RwLock<Option<u64>>>,
    /// If set, the next body ends cleanly after this many bytes.
    end_after: Arc<RwLock<Option<u64>>>,
    ignore_range: Arc<RwLock<bool>>,
    /// Whether responses announce the total size.
    announce_size: Arc<RwLock<bool>>,
    chunk_size: Arc<RwLock<usize>>,
    chunk_delay_ms: Arc<RwLock<u64>>,
    fetches: Arc<RwLock<Vec<RecordedFetch>>>,
    bytes_served: Arc<AtomicU64>,
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFetcher {
    /// Create a fetcher with no files.
    pub fn new() -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(VecDeque::new())),
            cut_after: Arc::new(RwLock::new(None)),
            end_after: Arc::new(RwLock::new(None)),
            ignore_range: Arc::new(RwLock::new(false)),
            announce_size: Arc::new(RwLock::new(true)),
            chunk_size: Arc::new(RwLock::new(1024)),
            chunk_delay_ms: Arc::new(RwLock::new(0)),
            fetches: Arc::new(RwLock::new(Vec::new())),
            bytes_served: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serve `content` at `url`.
    pub async fn add_file(&self, url: &str, content: Vec<u8>) {
        self.files.write().await.insert(url.to_string(), content);
    }

    /// Make the next fetch fail with `error`.
    pub async fn fail_next(&self, error: FetchError) {
        self.failures.write().await.push_back(error);
    }

    /// Make the next `n` fetches fail with `error`.
    pub async fn fail_next_n(&self, n: usize, error: FetchError) {
        let mut failures = self.failures.write().await;
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Make the next body drop the connection after `bytes` bytes.
    pub async fn cut_next_after(&self, bytes: u64) {
        *self.cut_after.write().await = Some(bytes);
    }

    /// Make the next body end early, without an error, after `bytes` bytes.
    pub async fn end_next_after(&self, bytes: u64) {
        *self.end_after.write().await = Some(bytes);
    }

    /// Answer range requests with the whole file.
    pub async fn set_ignore_range(&self, ignore: bool) {
        *self.ignore_range.write().await = ignore;
    }

    /// Whether responses carry the total size.
    pub async fn set_announce_size(&self, announce: bool) {
        *self.announce_size.write().await = announce;
    }

    pub async fn set_chunk_size(&self, size: usize) {
        *self.chunk_size.write().await = size.max(1);
    }

    /// Delay before every chunk.
    pub async fn set_chunk_delay_ms(&self, ms: u64) {
        *self.chunk_delay_ms.write().await = ms;
    }

    /// All fetches, in call order.
    pub async fn recorded_fetches(&self) -> Vec<RecordedFetch> {
        self.fetches.read().await.clone()
    }

    pub async fn fetch_count(&self) -> usize {
        self.fetches.read().await.len()
    }

    /// Bytes handed out across all bodies.
    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    /// Wait until at least `bytes` bytes were served.
    pub async fn wait_for_bytes(&self, bytes: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.bytes_served() >= bytes {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.bytes_served() >= bytes
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse, FetchError> {
        self.fetches.write().await.push(RecordedFetch {
            url: url.to_string(),
            offset,
        });

        if let Some(error) = self.failures.write().await.pop_front() {
            return Err(error);
        }

        let content = self
            .files
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                message: format!("no such file: {}", url),
            })?;
        let total = content.len() as u64;

        let resumed = offset > 0 && !*self.ignore_range.read().await;
        let start = if resumed { offset } else { 0 };
        if start > total {
            return Err(FetchError::Status {
                status: 416,
                message: "range not satisfiable".to_string(),
            });
        }

        let chunk_size = *self.chunk_size.read().await;
        let delay = Duration::from_millis(*self.chunk_delay_ms.read().await);
        let cut_after = self.cut_after.write().await.take();
        let end_after = self.end_after.write().await.take();
        let limit = cut_after.or(end_after);
        let served = Arc::clone(&self.bytes_served);

        let chunks: Vec<Vec<u8>> = content[start as usize..]
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();

        let body = stream::unfold(
            (chunks.into_iter(), 0u64, false),
            move |(mut chunks, mut sent, done)| {
                let served = Arc::clone(&served);
                async move {
                    if done {
                        return None;
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if limit.is_some_and(|limit| sent >= limit) {
                        if cut_after.is_none() {
                            return None;
                        }
                        let error = FetchError::Connection("connection reset by peer".to_string());
                        return Some((Err(error), (chunks, sent, true)));
                    }
                    let mut chunk = chunks.next()?;
                    if let Some(limit) = limit {
                        chunk.truncate((limit - sent).min(chunk.len() as u64) as usize);
                    }
                    sent += chunk.len() as u64;
                    served.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                    Some((Ok(chunk), (chunks, sent, false)))
                }
            },
        )
        .boxed();

        let total_size = if *self.announce_size.read().await {
            Some(total)
        } else {
            None
        };

        Ok(FetchResponse {
            resumed,
            total_size,
            body,
        })
    }
}
