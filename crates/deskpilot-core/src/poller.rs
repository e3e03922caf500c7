//! Per-container status polling
//!
//! One task per watched container id publishes a `StatusEvent` every poll
//! interval while the id has subscribers. Subscribing and the task's
//! "anyone left?" check both happen under the same lock, so a new watcher
//! can never attach to a task that is about to exit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, Instrument};

use crate::broadcast::{Broadcaster, Subscription};
use crate::lifecycle::{ContainerState, LifecycleManager, StatusEvent};
use crate::obs;

pub struct StatusPoller {
    lifecycle: Arc<LifecycleManager>,
    events: Broadcaster<StatusEvent>,
    interval: Duration,
    active: Arc<Mutex<HashSet<String>>>,
}

impl StatusPoller {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        events: Broadcaster<StatusEvent>,
        interval: Duration,
    ) -> Self {
        StatusPoller {
            lifecycle,
            events,
            interval,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        lock_active(&self.active)
    }

    /// Subscribe to status ticks for `id`, starting its poll task if needed.
    pub fn watch(&self, id: &str) -> Subscription<StatusEvent> {
        let mut active = self.active();
        let sub = self.events.subscribe(id);
        if active.insert(id.to_string()) {
            debug!(container_id = %id, "starting status poller");
            tokio::spawn(
                poll_loop(
                    Arc::clone(&self.lifecycle),
                    self.events.clone(),
                    Arc::clone(&self.active),
                    id.to_string(),
                    self.interval,
                )
                .instrument(obs::subject_span("status", id)),
            );
        }
        sub
    }

    /// Ids that currently have a poll task, sorted.
    pub fn active_subjects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active().iter().cloned().collect();
        ids.sort();
        ids
    }
}

fn lock_active(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

async fn poll_loop(
    lifecycle: Arc<LifecycleManager>,
    events: Broadcaster<StatusEvent>,
    active: Arc<Mutex<HashSet<String>>>,
    id: String,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        {
            let mut active = lock_active(&active);
            if events.subscriber_count(&id) == 0 {
                active.remove(&id);
                debug!(container_id = %id, "no watchers left, status poller exiting");
                return;
            }
        }

        let event = match lifecycle.inspect_status(&id).await {
            Ok(status) => StatusEvent::from(status),
            Err(e) => StatusEvent {
                status: ContainerState::Error,
                detail: format!("Error: {e}"),
                timestamp: chrono::Utc::now(),
            },
        };
        events.publish(&id, event);
    }
}
