//! Topic-based snapshot broadcasting.
//!
//! Publishers push complete snapshots; subscribers get a stream that starts
//! with the latest snapshot of the topic (if any) and then follows every
//! subsequent publish. A slow subscriber lags on its own receiver and never
//! blocks publishers. Dropping the stream only detaches that subscriber.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::download::DownloadSnapshot;
use crate::scheduler::QueueSnapshot;

/// Topic carrying the generation queue snapshot.
pub const QUEUE_TOPIC: &str = "queue";

/// Topic name for a single download.
pub fn download_topic(download_id: &str) -> String {
    format!("download:{}", download_id)
}

/// Snapshot carried on the shared broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "snapshot", rename_all = "snake_case")]
pub enum ProgressEvent {
    Queue(QueueSnapshot),
    Download(DownloadSnapshot),
}

/// The broadcaster shared by the scheduler and the download manager.
pub type SharedBroadcaster = std::sync::Arc<ProgressBroadcaster<ProgressEvent>>;

struct TopicChannel<S> {
    latest: Option<S>,
    sender: broadcast::Sender<S>,
}

/// Fan-out of snapshots keyed by topic, with replay of the latest snapshot.
pub struct ProgressBroadcaster<S> {
    capacity: usize,
    topics: Mutex<HashMap<String, TopicChannel<S>>>,
}

impl<S> ProgressBroadcaster<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a new broadcaster with the given per-topic channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a snapshot to a topic, replacing its latest snapshot.
    pub fn publish(&self, topic: &str, snapshot: S) {
        let mut topics = self.topics.lock().unwrap();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicChannel {
                latest: None,
                sender: broadcast::channel(self.capacity).0,
            });
        channel.latest = Some(snapshot.clone());
        // Ignore send errors - they just mean no one is listening
        let _ = channel.sender.send(snapshot);
    }

    /// Subscribe to a topic.
    ///
    /// The returned stream yields the current snapshot immediately (when the
    /// topic has one) and then every later publish, until the topic is closed.
    pub fn subscribe(&self, topic: &str) -> BoxStream<'static, S> {
        let (latest, rx) = {
            let mut topics = self.topics.lock().unwrap();
            let channel = topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicChannel {
                    latest: None,
                    sender: broadcast::channel(self.capacity).0,
                });
            (channel.latest.clone(), channel.sender.subscribe())
        };

        let topic = topic.to_string();
        let live = stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(snapshot) => return Some((snapshot, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(topic = %topic, skipped, "Subscriber lagged, skipping stale snapshots");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        stream::iter(latest).chain(live).boxed()
    }

    /// Latest snapshot published on a topic.
    pub fn latest(&self, topic: &str) -> Option<S> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .and_then(|c| c.latest.clone())
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a topic. Open streams end once they drained what was published.
    pub fn close(&self, topic: &str) {
        self.topics.lock().unwrap().remove(topic);
    }
}

impl<S> Default for ProgressBroadcaster<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(64)
    }
}
