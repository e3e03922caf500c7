//! Leading/trailing rate limiter for progress updates
//!
//! The first value of a window is emitted at once; later values in the same
//! window replace each other as the pending trailing value, which becomes
//! due when the window closes. `flush` hands out the pending value early,
//! for use right before a terminal update.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Throttle {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Offer a value at `now`. Returns it when it may be emitted immediately,
    /// otherwise keeps it as the pending trailing value.
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        match self.last_emit {
            Some(last) if now < last + self.interval => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.last_emit = Some(now);
                self.pending = None;
                Some(value)
            }
        }
    }

    /// When the pending value becomes due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.pending, self.last_emit) {
            (Some(_), Some(last)) => Some(last + self.interval),
            _ => None,
        }
    }

    /// The pending value, if its window has closed by `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(due) if due <= now => {
                self.last_emit = Some(now);
                self.pending.take()
            }
            _ => None,
        }
    }

    /// The pending value regardless of timing.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take()
    }
}
