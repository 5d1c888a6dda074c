//! Fixed window rate limiting algorithm
//!
//! Counts grants inside discrete, non-overlapping windows. Because windows
//! are discrete, up to `2 * capacity` requests can pass in a short span that
//! straddles a window boundary. That is a property of the algorithm and is
//! kept as is.

use super::{LimiterState, RateLimitStatus};
use crate::rate_limit_config::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    count: u32,
    window_start_at: u64,
    capacity: u32,
    window_ms: u64,
}

impl FixedWindow {
    pub fn new(capacity: u32, window_ms: u64, now: u64) -> Self {
        Self {
            count: 0,
            window_start_at: now,
            capacity,
            window_ms: window_ms.max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn window_start_at(&self) -> u64 {
        self.window_start_at
    }

    fn roll(&mut self, now: u64) {
        if now.saturating_sub(self.window_start_at) >= self.window_ms {
            self.count = 0;
            self.window_start_at = now;
        }
    }
}

impl LimiterState for FixedWindow {
    fn from_config(config: &RateLimitConfig, now: u64) -> Self {
        Self::new(config.max_requests, config.window_ms(), now)
    }

    fn reconfigure(&mut self, config: &RateLimitConfig) {
        self.capacity = config.max_requests;
        self.window_ms = config.window_ms();
    }

    fn evaluate(&mut self, now: u64, consume: bool) -> RateLimitStatus {
        self.roll(now);

        let reset_at = self.window_start_at + self.window_ms;
        if self.count < self.capacity {
            if consume {
                self.count += 1;
            }
            RateLimitStatus::allowed(self.capacity - self.count, reset_at)
        } else {
            RateLimitStatus::denied(reset_at, reset_at.saturating_sub(now))
        }
    }

    fn is_idle(&self, now: u64, _idle_ttl_ms: u64) -> bool {
        now.saturating_sub(self.window_start_at) >= self.window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixth_request_waits_for_window_end() {
        let mut window = FixedWindow::new(5, 60_000, 1_000);
        for _ in 0..5 {
            assert!(window.evaluate(1_500, true).allowed);
        }

        let status = window.evaluate(1_500, true);
        assert!(!status.allowed);
        assert_eq!(status.retry_after, Some(1_000 + 60_000 - 1_500));
        assert_eq!(window.count(), 5);
    }

    #[test]
    fn test_count_resets_at_boundary() {
        let mut window = FixedWindow::new(5, 60_000, 0);
        for _ in 0..5 {
            window.evaluate(10, true);
        }
        assert!(!window.evaluate(59_999, true).allowed);

        let status = window.evaluate(60_000, false);
        assert_eq!(window.count(), 0);
        assert_eq!(window.window_start_at(), 60_000);
        assert!(status.allowed);
        assert_eq!(status.remaining, 5);
    }

    #[test]
    fn test_boundary_burst_allows_double_capacity() {
        let mut window = FixedWindow::new(5, 1_000, 0);
        window.evaluate(0, true);
        let mut granted = 0;
        for t in 990..995 {
            if window.evaluate(t, true).allowed {
                granted += 1;
            }
        }
        for t in 1_000..1_005 {
            if window.evaluate(t, true).allowed {
                granted += 1;
            }
        }
        // 4 just before the boundary plus 5 just after, all within 15ms
        assert_eq!(granted, 9);
    }
}
