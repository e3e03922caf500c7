//! Global atomic counters for deskpilot.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does so on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    builds_started: AtomicU64,
    downloads_started: AtomicU64,
    observers_connected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            builds_started: AtomicU64::new(0),
            downloads_started: AtomicU64::new(0),
            observers_connected: AtomicU64::new(0),
        }
    }

    /// Count deliveries accepted by subscribers.
    pub fn add_events_published(&self, n: u64) {
        self.events_published.fetch_add(n, Ordering::Relaxed);
    }

    /// Count one event dropped for a saturated subscriber.
    pub fn inc_events_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "events_dropped", "counter incremented");
    }

    pub fn inc_builds_started(&self) {
        self.builds_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_started", "counter incremented");
    }

    pub fn inc_downloads_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "downloads_started", "counter incremented");
    }

    pub fn inc_observers_connected(&self) {
        self.observers_connected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "observers_connected", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_published = self.events_published(),
            events_dropped = self.events_dropped(),
            builds_started = self.builds_started(),
            downloads_started = self.downloads_started(),
            observers_connected = self.observers_connected(),
        );
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::Relaxed)
    }

    pub fn downloads_started(&self) -> u64 {
        self.downloads_started.load(Ordering::Relaxed)
    }

    pub fn observers_connected(&self) -> u64 {
        self.observers_connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.add_events_published(3);
        m.inc_events_dropped();
        m.inc_builds_started();
        m.inc_downloads_started();
        m.inc_downloads_started();
        m.inc_observers_connected();

        assert_eq!(m.events_published(), 3);
        assert_eq!(m.events_dropped(), 1);
        assert_eq!(m.builds_started(), 1);
        assert_eq!(m.downloads_started(), 2);
        assert_eq!(m.observers_connected(), 1);
    }
}
