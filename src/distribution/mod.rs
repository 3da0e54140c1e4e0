//! Config distribution: fan-out of rendered documents to relay subscribers
//!
//! Every config artifact has a topic keyed by its [`ObjectKey`]. The
//! operator publishes each document it writes; subscribers receive the
//! latest version right away (or wait for the first one) and then every
//! newer version in order.
//!
//! Publishing never waits on subscribers. A topic keeps the newest version
//! in a `watch` channel and recent versions in a bounded `broadcast`
//! buffer:
//! - [`DeliveryPolicy::Latest`] subscribers read the `watch` channel and
//!   only ever see the newest version
//! - [`DeliveryPolicy::Every`] subscribers read the broadcast buffer; when
//!   they fall behind they skip to the newest version
//!
//! Versions are per-key and strictly increasing. Publishing a document equal
//! to the current one does not create a version.

mod server;

pub use server::{router, serve, DistributionError, DistributionState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::crd::ObjectKey;
use crate::document::RenderedConfig;

/// One version of a config document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    /// Per-key version, starting at 1
    pub version: u64,
    /// The document
    pub config: RenderedConfig,
}

/// Which versions a subscriber wants
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Only the newest version; intermediate versions may be skipped
    #[default]
    Latest,
    /// Every version, unless the subscriber falls too far behind
    Every,
}

struct Topic {
    id: u64,
    version: u64,
    latest: watch::Sender<Option<Arc<ConfigUpdate>>>,
    every: broadcast::Sender<Arc<ConfigUpdate>>,
}

impl Topic {
    fn new(id: u64, buffer: usize) -> Self {
        let (latest, _) = watch::channel(None);
        let (every, _) = broadcast::channel(buffer.max(1));
        Self {
            id,
            version: 0,
            latest,
            every,
        }
    }
}

type Topics = DashMap<ObjectKey, Topic>;

/// Registry of config topics
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct ConfigDistributor {
    topics: Arc<Topics>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl std::fmt::Debug for ConfigDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDistributor")
            .field("topics", &self.topics.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl ConfigDistributor {
    /// Create a distributor whose every-version subscribers buffer
    /// `buffer` versions each
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer,
        }
    }

    fn new_topic(&self) -> Topic {
        Topic::new(self.next_id.fetch_add(1, Ordering::Relaxed), self.buffer)
    }

    /// Publish a document, returning the version subscribers will see
    ///
    /// Publishing the current document again returns the current version.
    pub fn publish(&self, key: &ObjectKey, config: RenderedConfig) -> u64 {
        let mut entry = self.topics.entry(key.clone()).or_insert_with(|| self.new_topic());
        let topic = entry.value_mut();

        let current = topic.latest.borrow().clone();
        if let Some(current) = current.filter(|c| c.config == config) {
            trace!(key = %key, version = current.version, "Config unchanged, not publishing");
            return current.version;
        }

        topic.version += 1;
        let update = Arc::new(ConfigUpdate {
            version: topic.version,
            config,
        });
        topic.latest.send_replace(Some(update.clone()));
        // No every-version subscribers is not an error
        let _ = topic.every.send(update);
        debug!(
            key = %key,
            version = topic.version,
            subscribers = topic.latest.receiver_count(),
            "Published config"
        );
        topic.version
    }

    /// Publish an empty document and close the topic
    ///
    /// Subscribers see the empty document, then the end of their stream.
    pub fn remove(&self, key: &ObjectKey) {
        if !self.topics.contains_key(key) {
            return;
        }
        self.publish(key, RenderedConfig::default());
        if self.topics.remove(key).is_some() {
            debug!(key = %key, "Closed config topic");
        }
    }

    /// Newest version of a document, if one was published
    pub fn latest(&self, key: &ObjectKey) -> Option<Arc<ConfigUpdate>> {
        self.topics.get(key).and_then(|t| t.latest.borrow().clone())
    }

    /// Subscribe to a key, creating the topic if nothing was published yet
    pub fn subscribe(&self, key: &ObjectKey, policy: DeliveryPolicy) -> Subscription {
        let entry = self.topics.entry(key.clone()).or_insert_with(|| self.new_topic());
        let latest = entry.latest.subscribe();
        let initial = latest.borrow().clone();
        let every = entry.every.subscribe();
        let topic_id = entry.id;
        drop(entry);

        debug!(key = %key, ?policy, "New config subscriber");
        Subscription {
            key: key.clone(),
            policy,
            topic_id,
            initial,
            latest,
            every,
            delivered: 0,
            topics: self.topics.clone(),
        }
    }

    /// Keys with a published document, ordered
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .topics
            .iter()
            .filter(|t| t.version > 0)
            .map(|t| t.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live subscribers of a key
    pub fn subscriber_count(&self, key: &ObjectKey) -> usize {
        self.topics.get(key).map_or(0, |t| t.latest.receiver_count())
    }
}

/// A subscriber's view of one topic
pub struct Subscription {
    key: ObjectKey,
    policy: DeliveryPolicy,
    topic_id: u64,
    initial: Option<Arc<ConfigUpdate>>,
    latest: watch::Receiver<Option<Arc<ConfigUpdate>>>,
    every: broadcast::Receiver<Arc<ConfigUpdate>>,
    delivered: u64,
    topics: Arc<Topics>,
}

impl Subscription {
    /// Key this subscription follows
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Delivery policy of this subscription
    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Next version, or `None` once the topic is closed
    pub async fn next(&mut self) -> Option<Arc<ConfigUpdate>> {
        match self.policy {
            DeliveryPolicy::Latest => self.next_latest().await,
            DeliveryPolicy::Every => self.next_every().await,
        }
    }

    fn newer(&mut self, update: Option<Arc<ConfigUpdate>>) -> Option<Arc<ConfigUpdate>> {
        let update = update.filter(|u| u.version > self.delivered)?;
        self.delivered = update.version;
        Some(update)
    }

    async fn next_latest(&mut self) -> Option<Arc<ConfigUpdate>> {
        loop {
            let current = self.latest.borrow_and_update().clone();
            if let Some(update) = self.newer(current) {
                return Some(update);
            }
            if self.latest.changed().await.is_err() {
                let last = self.latest.borrow().clone();
                return self.newer(last);
            }
        }
    }

    async fn next_every(&mut self) -> Option<Arc<ConfigUpdate>> {
        if let Some(update) = self.initial.take() {
            if let Some(update) = self.newer(Some(update)) {
                return Some(update);
            }
        }
        loop {
            match self.every.recv().await {
                Ok(update) => {
                    if let Some(update) = self.newer(Some(update)) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "Subscriber lagged, skipping to latest");
                    let current = self.latest.borrow().clone();
                    if let Some(update) = self.newer(current) {
                        return Some(update);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let last = self.latest.borrow().clone();
                    return self.newer(last);
                }
            }
        }
    }

    /// Turn the subscription into a stream of versions
    pub fn into_stream(self) -> impl Stream<Item = Arc<ConfigUpdate>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let update = sub.next().await?;
            Some((update, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Topics created by subscribers and never published to go away with
        // their last subscriber; our own receiver is still counted here.
        let id = self.topic_id;
        self.topics
            .remove_if(&self.key, |_, t| {
                t.id == id && t.version == 0 && t.latest.receiver_count() <= 1
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ClusterConfig, ClusterType};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    fn key() -> ObjectKey {
        ObjectKey::namespaced("default", "gw")
    }

    fn doc(endpoint: &str) -> RenderedConfig {
        RenderedConfig {
            listeners: vec![],
            clusters: vec![ClusterConfig {
                name: "default/route".to_string(),
                type_: ClusterType::Static,
                endpoints: [endpoint.to_string()].into(),
            }],
        }
    }

    async fn next(sub: &mut Subscription) -> Option<Arc<ConfigUpdate>> {
        timeout(Duration::from_secs(1), sub.next()).await.expect("subscription stalled")
    }

    #[test]
    fn test_identical_publish_keeps_version() {
        let dist = ConfigDistributor::new(4);
        assert_eq!(dist.publish(&key(), doc("10.0.0.1")), 1);
        assert_eq!(dist.publish(&key(), doc("10.0.0.1")), 1);
        assert_eq!(dist.publish(&key(), doc("10.0.0.2")), 2);
        assert_eq!(dist.latest(&key()).unwrap().version, 2);
        assert_eq!(dist.keys(), vec![key()]);
    }

    #[tokio::test]
    async fn test_late_subscriber_starts_from_latest() {
        let dist = ConfigDistributor::new(4);
        dist.publish(&key(), doc("10.0.0.1"));
        dist.publish(&key(), doc("10.0.0.2"));

        for policy in [DeliveryPolicy::Latest, DeliveryPolicy::Every] {
            let mut sub = dist.subscribe(&key(), policy);
            let first = next(&mut sub).await.unwrap();
            assert_eq!(first.version, 2);
        }
    }

    /// Story: a subscriber that connects before any config waits for it
    #[tokio::test]
    async fn story_subscriber_waits_for_first_version() {
        let dist = ConfigDistributor::new(4);
        let mut sub = dist.subscribe(&key(), DeliveryPolicy::Latest);
        assert!(dist.keys().is_empty());
        assert_eq!(dist.subscriber_count(&key()), 1);

        let publisher = dist.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&key(), doc("10.0.0.1"));
        });

        let update = next(&mut sub).await.unwrap();
        assert_eq!(update.version, 1);
    }

    /// Story: every-version subscribers see each version in order
    #[tokio::test]
    async fn story_every_policy_sees_every_version() {
        let dist = ConfigDistributor::new(8);
        dist.publish(&key(), doc("10.0.0.1"));
        let mut sub = dist.subscribe(&key(), DeliveryPolicy::Every);
        for i in 2..=5 {
            dist.publish(&key(), doc(&format!("10.0.0.{i}")));
        }

        let mut versions = Vec::new();
        for _ in 0..5 {
            versions.push(next(&mut sub).await.unwrap().version);
        }
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    /// Story: a slow subscriber skips stale versions but gets the latest
    #[tokio::test]
    async fn story_slow_subscriber_skips_to_latest() {
        let dist = ConfigDistributor::new(2);
        let mut latest = dist.subscribe(&key(), DeliveryPolicy::Latest);
        let mut every = dist.subscribe(&key(), DeliveryPolicy::Every);
        for i in 1..=10 {
            dist.publish(&key(), doc(&format!("10.0.0.{i}")));
        }

        assert_eq!(next(&mut latest).await.unwrap().version, 10);

        let mut seen = Vec::new();
        while seen.last() != Some(&10) {
            seen.push(next(&mut every).await.unwrap().version);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 10);
    }

    /// Story: removing a topic hands subscribers an empty document, then ends
    #[tokio::test]
    async fn story_remove_publishes_empty_then_closes() {
        let dist = ConfigDistributor::new(4);
        dist.publish(&key(), doc("10.0.0.1"));
        let mut latest = dist.subscribe(&key(), DeliveryPolicy::Latest);
        let mut every = dist.subscribe(&key(), DeliveryPolicy::Every);
        assert_eq!(next(&mut latest).await.unwrap().version, 1);
        assert_eq!(next(&mut every).await.unwrap().version, 1);

        dist.remove(&key());

        for sub in [&mut latest, &mut every] {
            let last = next(sub).await.unwrap();
            assert_eq!(last.version, 2);
            assert!(last.config.is_empty());
            assert!(next(sub).await.is_none());
        }
        assert!(dist.latest(&key()).is_none());
        assert!(dist.keys().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_last_waiting_subscriber_prunes_topic() {
        let dist = ConfigDistributor::new(4);
        let sub = dist.subscribe(&key(), DeliveryPolicy::Latest);
        let other = dist.subscribe(&key(), DeliveryPolicy::Every);
        drop(sub);
        assert_eq!(dist.subscriber_count(&key()), 1);
        drop(other);
        assert_eq!(dist.subscriber_count(&key()), 0);

        dist.publish(&key(), doc("10.0.0.1"));
        drop(dist.subscribe(&key(), DeliveryPolicy::Latest));
        assert!(dist.latest(&key()).is_some());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let dist = ConfigDistributor::new(4);
        dist.publish(&key(), doc("10.0.0.1"));
        let mut stream = Box::pin(dist.subscribe(&key(), DeliveryPolicy::Latest).into_stream());
        assert_eq!(stream.next().await.unwrap().version, 1);
        dist.remove(&key());
        assert!(stream.next().await.unwrap().config.is_empty());
        assert!(stream.next().await.is_none());
    }
}
