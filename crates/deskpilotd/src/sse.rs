//! Server-sent event relay
//!
//! Each stream connection gets one relay task that owns the broadcaster
//! subscription and an [`ObserverGuard`]. The task sends the opening
//! snapshot, then forwards subscription events and keep-alive records until
//! the client goes away, the subject finishes, or the subscription closes.
//! Server shutdown ends every relay too. Dropping the task's state
//! unsubscribes and reports the disconnect, so cleanup happens exactly once
//! whichever way the stream ends.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use chrono::Utc;
use deskpilot_core::{emit_observer_connected, emit_observer_disconnected, obs, Subscription, METRICS};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::state::AppState;

pub type EventStream = Sse<ReceiverStream<Result<Event, Infallible>>>;

const RELAY_BUFFER: usize = 64;

/// What to do with one subscription event.
pub enum Step {
    Send(Event),
    /// Send, then end the stream
    Last(Event),
    Skip,
}

/// Reports observer connect on creation and disconnect on drop.
///
/// Attached helper tasks live exactly as long as the observer.
pub struct ObserverGuard {
    stream: &'static str,
    subject: String,
    delivered: u64,
    helpers: Vec<AbortHandle>,
}

impl ObserverGuard {
    pub fn open(stream: &'static str, subject: &str) -> Self {
        METRICS.inc_observers_connected();
        emit_observer_connected(stream, subject);
        ObserverGuard {
            stream,
            subject: subject.to_string(),
            delivered: 0,
            helpers: Vec::new(),
        }
    }

    /// Abort `task` when this observer goes away.
    pub fn attach(&mut self, task: AbortHandle) {
        self.helpers.push(task);
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        for task in &self.helpers {
            task.abort();
        }
        emit_observer_disconnected(self.stream, &self.subject, self.delivered);
    }
}

/// JSON payload with a `timestamp` field added when missing.
pub fn stamped<T: Serialize>(value: &T) -> Value {
    let mut value = serde_json::to_value(value).unwrap_or(Value::Null);
    match &mut value {
        Value::Object(map) => {
            map.entry("timestamp").or_insert_with(|| json!(Utc::now()));
        }
        _ => value = json!({ "value": value, "timestamp": Utc::now() }),
    }
    value
}

/// Plain `data:` record.
pub fn data_event<T: Serialize>(value: &T) -> Event {
    Event::default().data(stamped(value).to_string())
}

/// Opening record sent on connect.
pub fn snapshot_event<T: Serialize>(value: &T) -> Event {
    Event::default()
        .event("snapshot")
        .data(stamped(value).to_string())
}

pub fn keepalive_event() -> Event {
    Event::default()
        .event("keepalive")
        .data(json!({ "type": "keepalive", "timestamp": Utc::now() }).to_string())
}

/// Spawn the relay task and return the response stream.
///
/// With `finished`, only `opening` is sent and the stream ends.
pub fn relay<T, F>(
    state: &AppState,
    opening: Vec<Event>,
    finished: bool,
    mut sub: Subscription<T>,
    guard: ObserverGuard,
    mut step: F,
) -> EventStream
where
    T: Clone + Send + 'static,
    F: FnMut(T) -> Step + Send + 'static,
{
    let keepalive = state.keepalive;
    let closing = state.closing.clone();
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    let span = obs::subject_span(guard.stream, &guard.subject);

    tokio::spawn(
        async move {
            // Move the whole guard into the task, not just `delivered`.
            let mut guard = guard;
            for event in opening {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
                guard.delivered += 1;
            }
            if finished {
                return;
            }

            let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let (event, last) = tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => (keepalive_event(), false),
                    item = sub.recv() => match item {
                        None => break,
                        Some(item) => match step(item) {
                            Step::Skip => continue,
                            Step::Send(event) => (event, false),
                            Step::Last(event) => (event, true),
                        },
                    },
                };
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
                guard.delivered += 1;
                if last {
                    break;
                }
            }
            sub.unsubscribe();
        }
        .instrument(span),
    );

    Sse::new(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Tick {
        status: &'static str,
    }

    #[test]
    fn test_stamped_adds_timestamp_once() {
        let v = stamped(&Tick { status: "running" });
        assert_eq!(v["status"], "running");
        assert!(v["timestamp"].is_string());

        let kept = stamped(&json!({ "timestamp": "2024-01-01T00:00:00Z" }));
        assert_eq!(kept["timestamp"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_non_object_payload_is_wrapped() {
        let v = stamped(&42);
        assert_eq!(v["value"], 42);
        assert!(v["timestamp"].is_string());
    }
}
