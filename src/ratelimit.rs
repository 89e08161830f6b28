use std::collections::HashMap;
use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
}

/// Fixed-window attempt counter over opaque identifiers (user ids, IPs).
///
/// The in-memory implementation below suits a single-process deployment; a
/// shared-cache implementation can be slotted in behind this trait for
/// multi-process setups without touching call sites.
pub trait RateLimiter: Send + Sync {
    /// Counts one attempt against `key`. The window rolls over lazily on
    /// the first call after `reset_at`; there is no background timer per key.
    fn check(&self, key: &str, max_attempts: u32, window: Duration) -> Decision;

    /// Clears the counter for `key`, e.g. after the guarded operation
    /// succeeded and immediate legitimate reuse should not be penalized.
    fn reset(&self, key: &str);

    /// Drops entries whose window has passed; returns how many were removed.
    fn cleanup_expired(&self) -> usize;
}

struct WindowEntry {
    count: u32,
    reset_at: OffsetDateTime,
}

#[derive(Default)]
pub struct InMemoryRateLimiter {
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn check(&self, key: &str, max_attempts: u32, window: Duration) -> Decision {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");

        let entry = entries.get_mut(key);
        match entry {
            Some(entry) if entry.reset_at > now => {
                if entry.count >= max_attempts {
                    // Denied attempts do not increment: count never exceeds
                    // the configured max within a window.
                    return Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.reset_at,
                    };
                }
                entry.count += 1;
                Decision {
                    allowed: true,
                    remaining: max_attempts - entry.count,
                    reset_at: entry.reset_at,
                }
            }
            _ => {
                let reset_at = now + window;
                entries.insert(
                    key.to_string(),
                    WindowEntry { count: 1, reset_at },
                );
                Decision {
                    allowed: true,
                    remaining: max_attempts.saturating_sub(1),
                    reset_at,
                }
            }
        }
    }

    fn reset(&self, key: &str) {
        self.entries
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(key);
    }

    fn cleanup_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_at > now);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allows_exactly_max_attempts_within_window() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::minutes(1);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("ip1", 3, window);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let fourth = limiter.check("ip1", 3, window);
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
    }

    #[test]
    fn window_rolls_over_lazily() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::milliseconds(30);

        assert!(limiter.check("k", 1, window).allowed);
        assert!(!limiter.check("k", 1, window).allowed);

        std::thread::sleep(std::time::Duration::from_millis(40));
        assert!(limiter.check("k", 1, window).allowed, "expired window resets on next call");
    }

    #[test]
    fn keys_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::minutes(1);

        assert!(limiter.check("a", 1, window).allowed);
        assert!(!limiter.check("a", 1, window).allowed);
        assert!(limiter.check("b", 1, window).allowed);
    }

    #[test]
    fn reset_clears_the_counter() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::minutes(1);

        assert!(limiter.check("k", 1, window).allowed);
        assert!(!limiter.check("k", 1, window).allowed);

        limiter.reset("k");
        assert!(limiter.check("k", 1, window).allowed);
    }

    #[test]
    fn cleanup_removes_only_expired_entries() {
        let limiter = InMemoryRateLimiter::new();

        limiter.check("stale", 5, Duration::milliseconds(10));
        limiter.check("fresh", 5, Duration::minutes(5));

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(limiter.cleanup_expired(), 1);

        // The fresh key kept its count.
        let decision = limiter.check("fresh", 5, Duration::minutes(5));
        assert_eq!(decision.remaining, 3);
    }

    #[test]
    fn concurrent_checks_never_exceed_the_budget() {
        let limiter = Arc::new(InMemoryRateLimiter::new());
        let window = Duration::minutes(1);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.check("shared", 5, window).allowed)
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|&allowed| allowed)
            .count();
        assert_eq!(allowed, 5);
    }
}
