//! Reconnect policy for stream followers.

use std::time::Duration;

/// Fixed-interval reconnect with bounded attempts and deterministic jitter.
///
/// The wait before attempt `n` is `interval ± jitter`, with the offset
/// derived from `n` so that concurrent followers spread out without a
/// random number generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Consecutive failed connects allowed; `None` retries forever
    pub max_attempts: Option<u32>,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_secs(5),
            max_attempts: Some(10),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn unlimited(self) -> Self {
        RetryPolicy {
            max_attempts: None,
            ..self
        }
    }

    /// Whether reconnect attempt `attempt` (1-based) is permitted.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Wait before reconnect attempt `attempt`. Never zero unless the
    /// interval itself is zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return self.interval;
        }
        // Spread over [-100, 100] percent of the jitter.
        let spread = (attempt.wrapping_mul(37) % 201) as i64 - 100;
        let offset = jitter_ms * spread / 100;
        let base = self.interval.as_millis() as i64;
        let floor = if base > 0 { 1 } else { 0 };
        Duration::from_millis((base + offset).max(floor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_waits_about_five_seconds() {
        let policy = RetryPolicy::default();
        for attempt in 1..50 {
            let d = policy.delay(attempt);
            assert!(d >= Duration::from_millis(4_500), "attempt {attempt}: {d:?}");
            assert!(d <= Duration::from_millis(5_500), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn test_jitter_varies_between_attempts() {
        let policy = RetryPolicy::default();
        assert_ne!(policy.delay(1), policy.delay(2));
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(2),
            max_attempts: Some(1),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay(7), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_never_spins() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(10),
            max_attempts: None,
            jitter: Duration::from_millis(50),
        };
        for attempt in 0..300 {
            assert!(policy.delay(attempt) >= Duration::from_millis(1));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(policy.unlimited().allows(u32::MAX));
    }
}
