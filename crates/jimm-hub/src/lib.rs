// In-process pub/sub hub keyed by string topic.
// Publishers never block: each subscriber owns a bounded buffer and the
// oldest entries are dropped when a subscriber falls behind.
use std::collections::HashMap;

use tokio::sync::{broadcast, oneshot, RwLock};

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("subscriber capacity must be non-zero")]
    ZeroCapacity,
    #[error("subscription lagged, {skipped} messages dropped")]
    Lagged { skipped: u64 },
    #[error("hub closed")]
    Closed,
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Completion handle returned by [`Hub::publish`].
///
/// The handle resolves once the message has been handed to every current
/// subscriber's buffer. Because buffers are bounded and never block the
/// publisher, delivery completes as soon as the fan-out loop finishes.
pub struct Delivery {
    subscribers: usize,
    done: oneshot::Receiver<()>,
}

impl Delivery {
    /// Number of subscriber buffers the message was handed to.
    pub fn subscribers(&self) -> usize {
        self.subscribers
    }

    /// Waits until delivery has completed.
    pub async fn done(self) {
        // The sender is dropped after fan-out, so either value or closure
        // means delivery finished.
        let _ = self.done.await;
    }
}

/// A subscription to a single topic.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Receives the next message, surfacing lag explicitly.
    pub async fn recv(&mut self) -> Result<T> {
        match self.rx.recv().await {
            Ok(v) => Ok(v),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(HubError::Lagged { skipped }),
            Err(broadcast::error::RecvError::Closed) => Err(HubError::Closed),
        }
    }

    /// Receives the next message, transparently skipping over dropped
    /// entries. Returns `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A subscription to every topic on the hub.
pub struct AllSubscription<T> {
    rx: broadcast::Receiver<(String, T)>,
}

impl<T: Clone> AllSubscription<T> {
    pub async fn recv(&mut self) -> Result<(String, T)> {
        match self.rx.recv().await {
            Ok(v) => Ok(v),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(HubError::Lagged { skipped }),
            Err(broadcast::error::RecvError::Closed) => Err(HubError::Closed),
        }
    }

    pub async fn next(&mut self) -> Option<(String, T)> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Topic-keyed fan-out hub.
///
/// ```
/// let hub = jimm_hub::Hub::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = hub.subscribe("model-uuid").await;
///     hub.publish("model-uuid", "summary".to_string()).await.done().await;
///     assert_eq!(sub.next().await.as_deref(), Some("summary"));
/// });
/// ```
pub struct Hub<T> {
    // Map of topic -> fan-out channel. Senders are retained even with no
    // subscribers so topic identity is stable across subscribe/publish races.
    topics: RwLock<HashMap<String, broadcast::Sender<T>>>,
    // Firehose channel carrying every published message with its topic.
    all: broadcast::Sender<(String, T)>,
    subscriber_capacity: usize,
}

impl<T> std::fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Hub<T> {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(DEFAULT_SUBSCRIBER_CAPACITY);
        Self {
            topics: RwLock::new(HashMap::new()),
            all,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    pub fn with_subscriber_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HubError::ZeroCapacity);
        }
        let (all, _) = broadcast::channel(capacity);
        Ok(Self {
            topics: RwLock::new(HashMap::new()),
            all,
            subscriber_capacity: capacity,
        })
    }

    /// Publishes `content` to every current subscriber of `topic` and to
    /// the firehose. Slow subscribers lose their oldest buffered entries
    /// rather than blocking the publisher.
    pub async fn publish(&self, topic: &str, content: T) -> Delivery {
        let mut subscribers = 0;
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                subscribers += sender.send(content.clone()).unwrap_or(0);
            }
        }
        subscribers += self
            .all
            .send((topic.to_string(), content))
            .unwrap_or(0);
        let (tx, rx) = oneshot::channel();
        // Fan-out is complete; resolve the handle immediately.
        let _ = tx.send(());
        Delivery {
            subscribers,
            done: rx,
        }
    }

    /// Subscribes to a single topic. The topic does not need to have been
    /// published to before.
    pub async fn subscribe(&self, topic: &str) -> Subscription<T> {
        let mut topics = self.topics.write().await;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.subscriber_capacity).0);
        Subscription {
            rx: sender.subscribe(),
        }
    }

    /// Subscribes to every topic published on this hub.
    pub fn subscribe_all(&self) -> AllSubscription<T> {
        AllSubscription {
            rx: self.all.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Hub<T> {
    fn default() -> Self {
        Self::new()
    }
}
