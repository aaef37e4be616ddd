//! Fixed-window request budgeting per token.
//!
//! One window per token id: `{count, window_end}`. The first request in a
//! fresh (or elapsed) window resets the counter; requests past the limit are
//! denied with the number of seconds until the window rolls over. Counters
//! are per-process; there is no cross-node coordination.
//!
//! A periodic [`sweep`](RateLimiter::sweep) evicts windows that ended a few
//! minutes ago so the table stays bounded no matter how many distinct tokens
//! have been seen.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Length of one accounting window.
const WINDOW: Duration = Duration::from_secs(60);

/// How long an elapsed window lingers before the sweeper evicts it.
const SWEEP_GRACE: Duration = Duration::from_secs(5 * 60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request fits in the current window.
    Allowed,
    /// The window budget is exhausted.
    Denied {
        /// Whole seconds until the window rolls over, at least 1.
        retry_after_secs: u64,
    },
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    window_end: Instant,
}

/// In-memory fixed-window rate limiter keyed by token id.
#[derive(Debug, Default)]
pub struct RateLimiter {
    window: Duration,
    grace: Duration,
    state: Mutex<HashMap<i64, WindowState>>,
}

impl RateLimiter {
    /// Creates a limiter with the standard one-minute window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(WINDOW, SWEEP_GRACE)
    }

    /// Creates a limiter with a custom window and sweep grace. Used by tests
    /// that cannot wait out a real minute.
    #[must_use]
    pub fn with_window(window: Duration, grace: Duration) -> Self {
        Self {
            window,
            grace,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Checks whether a request under `key` fits within `limit` requests per
    /// window, counting it if so.
    pub fn check(&self, key: i64, limit: u32) -> Decision {
        let now = Instant::now();
        let mut state = self.lock();

        match state.get_mut(&key) {
            Some(win) if now < win.window_end => {
                if win.count < limit {
                    win.count += 1;
                    Decision::Allowed
                } else {
                    Decision::Denied {
                        retry_after_secs: ceil_secs(win.window_end - now),
                    }
                }
            }
            _ => {
                state.insert(
                    key,
                    WindowState {
                        count: 1,
                        window_end: now + self.window,
                    },
                );
                Decision::Allowed
            }
        }
    }

    /// Evicts windows that ended more than the grace period ago. Returns the
    /// number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.len();
        state.retain(|_, win| now < win.window_end + self.grace);
        before - state.len()
    }

    /// Number of tokens currently tracked. Useful for monitoring and tests.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, WindowState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rounds a duration up to whole seconds, never below 1.
fn ceil_secs(remaining: Duration) -> u64 {
    let whole = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    whole.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert_eq!(limiter.check(1, 5), Decision::Allowed);
        }
    }

    #[test]
    fn denies_when_limit_exceeded() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert_eq!(limiter.check(1, 3), Decision::Allowed);
        }

        match limiter.check(1, 3) {
            Decision::Denied { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            Decision::Allowed => panic!("fourth request should be denied"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.check(1, 1), Decision::Allowed);
        assert!(matches!(limiter.check(1, 1), Decision::Denied { .. }));
        assert_eq!(limiter.check(2, 1), Decision::Allowed);
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let limiter =
            RateLimiter::with_window(Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(limiter.check(1, 1), Decision::Allowed);
        assert!(matches!(limiter.check(1, 1), Decision::Denied { .. }));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(limiter.check(1, 1), Decision::Allowed);
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::with_window(Duration::from_millis(100), SWEEP_GRACE);
        assert_eq!(limiter.check(1, 1), Decision::Allowed);
        match limiter.check(1, 1) {
            Decision::Denied { retry_after_secs } => assert_eq!(retry_after_secs, 1),
            Decision::Allowed => panic!("should be denied"),
        }
    }

    #[test]
    fn sweep_evicts_only_stale_windows() {
        let limiter =
            RateLimiter::with_window(Duration::from_millis(20), Duration::from_millis(20));
        limiter.check(1, 10);
        limiter.check(2, 10);
        assert_eq!(limiter.tracked_keys(), 2);

        // Nothing is stale yet
        assert_eq!(limiter.sweep(), 0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1001)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(59)), 59);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
    }
}
