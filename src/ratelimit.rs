// Fixed-window request limiter keyed by caller identity. Enforcement is
// per-process; the window state lives in a shared map and entries reset
// when their window elapses.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of a limiter check, carrying the values for the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets; only meaningful on denial.
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    state: Arc<RwLock<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(max: u32, window_secs: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(window_secs.max(1)),
            state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one request for `key` and decide whether it is admitted.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = state.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        let elapsed = now.duration_since(window.started);
        let retry_after_secs = self.window.saturating_sub(elapsed).as_secs().max(1);

        if window.count >= self.max {
            return RateDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                retry_after_secs,
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            limit: self.max,
            remaining: self.max - window.count,
            retry_after_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_until_limit() {
        let limiter = RateLimiter::new(2, 60);
        assert!(limiter.check("u1").allowed);
        assert!(limiter.check("u1").allowed);
        let denied = limiter.check("u1");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs >= 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        assert!(limiter.check("u1").allowed);
        assert!(limiter.check("u2").allowed);
        assert!(!limiter.check("u1").allowed);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = RateLimiter::new(3, 60);
        assert_eq!(limiter.check("u1").remaining, 2);
        assert_eq!(limiter.check("u1").remaining, 1);
        assert_eq!(limiter.check("u1").remaining, 0);
    }
}
