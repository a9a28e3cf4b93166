//! [`RateLimiter`] – per-key send throttling.
//!
//! Sends for a key are spaced at least `min_interval` apart, except that a
//! quiet period longer than `burst_interval` always lets the next send
//! through.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BURST_INTERVAL: Duration = Duration::from_secs(5);

pub struct RateLimiter {
    last_sent: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
    burst_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, burst_interval: Duration) -> Self {
        Self {
            last_sent: Mutex::new(HashMap::new()),
            min_interval,
            burst_interval,
        }
    }

    /// Whether a send for `key` may happen now.  An allowed send is recorded.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last_sent = self.lock();
        let allowed = last_sent.get(key).is_none_or(|at| {
            let elapsed = now.duration_since(*at);
            elapsed > self.burst_interval || elapsed >= self.min_interval
        });
        if allowed {
            last_sent.insert(key.to_string(), now);
        }
        allowed
    }

    /// Forget `key`; its next send is allowed unconditionally.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL, DEFAULT_BURST_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_send_is_allowed() {
        let limiter = RateLimiter::default();
        assert!(limiter.allow("agv-01"));
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn sends_inside_min_interval_are_rejected() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Duration::from_secs(120));
        assert!(limiter.allow("agv-01"));
        assert!(!limiter.allow("agv-01"));
        assert!(limiter.allow("agv-02"));
    }

    #[test]
    fn send_after_min_interval_is_allowed() {
        let limiter = RateLimiter::new(Duration::from_millis(20), Duration::from_secs(60));
        assert!(limiter.allow("agv-01"));
        thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("agv-01"));
    }

    #[test]
    fn burst_interval_overrides_min_interval() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Duration::from_millis(20));
        assert!(limiter.allow("agv-01"));
        assert!(!limiter.allow("agv-01"));
        thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("agv-01"));
    }

    #[test]
    fn reset_forgets_key() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Duration::from_secs(120));
        assert!(limiter.allow("agv-01"));
        limiter.reset("agv-01");
        assert!(limiter.is_empty());
        assert!(limiter.allow("agv-01"));
    }
}
