//! Sliding window rate limiting algorithm
//!
//! Keeps the timestamp of every granted request inside the current window.
//! A timestamp `t` survives while `now - window_ms < t`.

use super::{LimiterState, RateLimitStatus};
use crate::rate_limit_config::RateLimitConfig;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    granted: VecDeque<u64>,
    capacity: u32,
    window_ms: u64,
}

impl SlidingWindow {
    pub fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            granted: VecDeque::new(),
            capacity,
            window_ms: window_ms.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    fn prune(&mut self, now: u64) {
        while let Some(&oldest) = self.granted.front() {
            if oldest + self.window_ms <= now {
                self.granted.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset_at(&self, now: u64) -> u64 {
        self.granted
            .front()
            .map(|oldest| oldest + self.window_ms)
            .unwrap_or(now + self.window_ms)
    }
}

impl LimiterState for SlidingWindow {
    fn from_config(config: &RateLimitConfig, _now: u64) -> Self {
        Self::new(config.max_requests, config.window_ms())
    }

    fn reconfigure(&mut self, config: &RateLimitConfig) {
        self.capacity = config.max_requests;
        self.window_ms = config.window_ms();
    }

    fn evaluate(&mut self, now: u64, consume: bool) -> RateLimitStatus {
        self.prune(now);

        let count = self.granted.len();
        let capacity = self.capacity as usize;
        if count < capacity {
            if consume {
                self.granted.push_back(now);
            }
            let remaining = capacity - self.granted.len();
            return RateLimitStatus::allowed(remaining as u32, self.reset_at(now));
        }

        // The slot frees up once enough old grants fall out of the window
        // to bring the count below capacity.
        let freeing = self.granted[count - capacity];
        let retry_after = (freeing + self.window_ms).saturating_sub(now);
        RateLimitStatus::denied(self.reset_at(now), retry_after)
    }

    fn is_idle(&self, now: u64, _idle_ttl_ms: u64) -> bool {
        self.granted
            .back()
            .map_or(true, |newest| newest + self.window_ms <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_capacity_then_denies() {
        let mut window = SlidingWindow::new(10, 1000);
        for i in 0..10 {
            let status = window.evaluate(i * 10, true);
            assert!(status.allowed, "request {} should pass", i);
            assert_eq!(status.remaining, 9 - i as u32);
        }

        let status = window.evaluate(500, true);
        assert!(!status.allowed);
        assert_eq!(status.retry_after, Some(500));
        assert_eq!(status.reset_at, 1000);
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_window_slides() {
        let mut window = SlidingWindow::new(2, 1000);
        window.evaluate(0, true);
        window.evaluate(400, true);
        assert!(!window.evaluate(999, true).allowed);

        // the grant at t=0 leaves the window at t=1000
        let status = window.evaluate(1000, true);
        assert!(status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_at, 1400);
    }

    #[test]
    fn test_empty_window_resets_relative_to_now() {
        let mut window = SlidingWindow::new(3, 1000);
        let status = window.evaluate(250, false);
        assert!(status.allowed);
        assert_eq!(status.remaining, 3);
        assert_eq!(status.reset_at, 1250);
        assert!(window.is_empty());
    }

    #[test]
    fn test_shrunk_capacity_waits_for_enough_expiries() {
        let mut window = SlidingWindow::new(4, 1000);
        for t in [0, 100, 200, 300] {
            window.evaluate(t, true);
        }
        window.reconfigure(&RateLimitConfig::sliding_window(2, std::time::Duration::from_secs(1)));

        let status = window.evaluate(500, true);
        assert!(!status.allowed);
        // needs the grants at 0, 100 and 200 gone
        assert_eq!(status.retry_after, Some(700));
    }

    #[test]
    fn test_idle_once_all_grants_expired() {
        let mut window = SlidingWindow::new(3, 1000);
        window.evaluate(100, true);
        assert!(!window.is_idle(1099, 0));
        assert!(window.is_idle(1100, 0));
    }

    #[test]
    fn test_huge_capacity_allocates_lazily() {
        let mut window = SlidingWindow::new(u32::MAX, 1000);
        assert!(window.is_empty());

        let status = window.evaluate(0, true);
        assert!(status.allowed);
        assert_eq!(status.remaining, u32::MAX - 1);
        assert_eq!(window.len(), 1);
    }
}
