//! In-process publish/subscribe hub
//!
//! Each subscriber owns a bounded `mpsc` channel. Publishing never waits:
//! an event that does not fit in a subscriber's buffer is dropped for that
//! subscriber only, and subscribers whose receiver is gone are pruned.
//! There is no replay; a subscriber sees only events published while it is
//! registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::metrics::METRICS;

type Topics<T> = HashMap<String, HashMap<u64, mpsc::Sender<T>>>;

struct Registry<T> {
    topics: Mutex<Topics<T>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<T> Registry<T> {
    fn topics(&self) -> MutexGuard<'_, Topics<T>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics();
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Topic-keyed fan-out of cloneable events.
pub struct Broadcaster<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Broadcaster {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// `capacity` is the delivery buffer of each subscriber.
    pub fn new(capacity: usize) -> Self {
        Broadcaster {
            registry: Arc::new(Registry {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a new subscriber on `topic`.
    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.registry.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .topics()
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);

        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            registry: Arc::downgrade(&self.registry),
            closed: false,
        }
    }

    /// Deliver `event` to every subscriber of `topic`.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&self, topic: &str, event: T) -> usize {
        let mut topics = self.registry.topics();
        let Some(subs) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                METRICS.inc_events_dropped();
                debug!(topic = %topic, subscriber = id, "subscriber saturated, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            topics.remove(topic);
        }

        METRICS.add_events_published(delivered as u64);
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.topics().get(topic).map_or(0, HashMap::len)
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry.topics().keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// A consumer's handle on one topic.
///
/// Closed exactly once, by [`Subscription::unsubscribe`] or on drop.
pub struct Subscription<T> {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<T>,
    registry: Weak<Registry<T>>,
    closed: bool,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Detach from the broadcaster. Buffered events are discarded.
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.topic, self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
