//! Fixed-window request limiting keyed by user id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Whole seconds until the current window resets (rounded up).
    pub reset_in: u64,
}

/// A limiter that can be swapped for a shared store without touching callers.
pub trait RateLimit: Send + Sync {
    fn check(&self, key: &str) -> RateLimitDecision;
    /// Evict windows that have already reset. Returns how many were removed.
    fn sweep(&self) -> usize;
}

/// Covers `[reset_at - window, reset_at)`. At `reset_at` itself the next
/// window has begun, so waiting `reset_in` seconds is always enough.
#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = windows
            .entry(key.to_string())
            .or_insert(RateLimitWindow {
                count: 0,
                reset_at: now,
            });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.window;
        }

        let reset_in = ceil_secs(entry.reset_at.saturating_duration_since(now));
        if entry.count >= self.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_in,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_in,
        }
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = windows.len();
        windows.retain(|_, w| w.reset_at > now);
        before - windows.len()
    }
}

impl RateLimit for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> FixedWindowLimiter {
        FixedWindowLimiter::new(10, Duration::from_secs(60))
    }

    #[test]
    fn tenth_allowed_eleventh_rejected() {
        let l = limiter();
        let t0 = Instant::now();
        for i in 1..=9 {
            let d = l.check_at("user-1", t0);
            assert!(d.allowed);
            assert_eq!(d.remaining, 10 - i);
        }
        let tenth = l.check_at("user-1", t0);
        assert!(tenth.allowed);
        assert_eq!(tenth.remaining, 0);

        let eleventh = l.check_at("user-1", t0 + Duration::from_secs(1));
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.remaining, 0);
        assert_eq!(eleventh.limit, 10);
        assert_eq!(eleventh.reset_in, 59);
    }

    #[test]
    fn fresh_window_after_reset() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..10 {
            l.check_at("user-1", t0);
        }
        let blocked = l.check_at("user-1", t0 + Duration::from_millis(500));
        assert!(!blocked.allowed);

        let after = t0 + Duration::from_secs(blocked.reset_in);
        let d = l.check_at("user-1", after);
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
        assert_eq!(d.reset_in, 60);
    }

    #[test]
    fn window_turns_over_exactly_at_reset() {
        let l = FixedWindowLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(l.check_at("u", t0).allowed);

        let reset_at = t0 + Duration::from_secs(60);
        let last_moment = l.check_at("u", reset_at - Duration::from_nanos(1));
        assert!(!last_moment.allowed);
        assert_eq!(last_moment.reset_in, 1);

        let at_reset = l.check_at("u", reset_at);
        assert!(at_reset.allowed);
        assert_eq!(at_reset.reset_in, 60);
        // Swept at the same instant the window turns over.
        assert_eq!(l.sweep_at(reset_at + Duration::from_secs(60)), 1);
    }

    #[test]
    fn keys_are_independent() {
        let l = FixedWindowLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(l.check_at("user-1", t0).allowed);
        assert!(!l.check_at("user-1", t0).allowed);
        assert!(l.check_at("user-2", t0).allowed);
    }

    #[test]
    fn rejected_requests_do_not_extend_window() {
        let l = FixedWindowLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();
        l.check_at("u", t0);
        for s in 1..10 {
            assert!(!l.check_at("u", t0 + Duration::from_secs(s)).allowed);
        }
        assert!(l.check_at("u", t0 + Duration::from_secs(10)).allowed);
    }

    #[test]
    fn sweep_evicts_expired_windows() {
        let l = limiter();
        let t0 = Instant::now();
        l.check_at("user-1", t0);
        l.check_at("user-2", t0 + Duration::from_secs(30));
        assert_eq!(l.sweep_at(t0 + Duration::from_secs(61)), 1);
        assert_eq!(l.sweep_at(t0 + Duration::from_secs(91)), 1);
    }
}
