//! Pacing for a listener whose `accept()` keeps failing.
//!
//! Accept errors are almost always transient resource exhaustion
//! (`EMFILE`/`ENFILE` when descriptors run out, `ENOBUFS`). Retrying at
//! once spins the loop hot while nothing can be freed, so each
//! consecutive failure doubles the pause up to a cap. The first
//! successful accept resets the streak. A streak that reaches the limit
//! means the listener itself is broken and the server should stop.

use std::time::Duration;

/// First pause after a failed accept.
const INITIAL_DELAY: Duration = Duration::from_millis(50);
/// Longest pause between two attempts.
const MAX_DELAY: Duration = Duration::from_secs(5);
/// Consecutive failures after which the listener is given up on.
const MAX_FAILURES: u32 = 50;

pub struct AcceptBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_failures: u32,
    current_delay: Duration,
    failures: u32,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY, MAX_FAILURES)
    }
}

impl AcceptBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_failures: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_failures,
            current_delay: initial_delay,
            failures: 0,
        }
    }

    /// Records a failed accept. Returns the pause before the next attempt,
    /// or `None` once the streak has reached the limit.
    pub fn failed(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures {
            return None;
        }
        let delay = self.current_delay;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);
        Some(delay)
    }

    /// A connection came through; the next failure starts a fresh streak.
    pub fn accepted(&mut self) {
        self.current_delay = self.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failed accepts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_descriptor_exhaustion_streak_backs_off_to_cap() {
        let mut b = AcceptBackoff::new(ms(50), ms(300), 50);
        let pauses: Vec<_> = (0..5).map(|_| b.failed().unwrap()).collect();
        // 400 capped at 300
        assert_eq!(pauses, vec![ms(50), ms(100), ms(200), ms(300), ms(300)]);
        assert_eq!(b.failures(), 5);
    }

    #[test]
    fn test_successful_accept_starts_fresh_streak() {
        let mut b = AcceptBackoff::default();
        for _ in 0..10 {
            b.failed();
        }
        b.accepted();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.failed(), Some(INITIAL_DELAY));
    }

    #[test]
    fn test_broken_listener_is_given_up() {
        let mut b = AcceptBackoff::default();
        for n in 1..MAX_FAILURES {
            assert!(b.failed().is_some(), "gave up after {n} failures");
        }
        assert_eq!(b.failed(), None);
        assert_eq!(b.failures(), MAX_FAILURES);
    }

    #[test]
    fn test_default_pacing_before_giving_up() {
        let mut b = AcceptBackoff::default();
        let pauses: Vec<_> = std::iter::from_fn(|| b.failed()).collect();
        assert_eq!(pauses.len(), 49);
        // 50ms doubling is capped from the 8th pause on
        assert_eq!(pauses[6], ms(3_200));
        assert!(pauses[7..].iter().all(|&d| d == MAX_DELAY));
        let total: Duration = pauses.iter().sum();
        assert_eq!(total, ms(6_350) + MAX_DELAY * 42);
    }
}
