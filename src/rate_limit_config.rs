use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::config::validate_non_zero_duration;

/// Traffic-shaping algorithm applied to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::FixedWindow => "fixed-window",
        };
        f.write_str(name)
    }
}

/// Limit applied to one key.
///
/// `max_requests` is the bucket capacity for the token bucket and the
/// per-window allowance for both window algorithms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    pub algorithm: Algorithm,

    #[validate(range(min = 1))]
    pub max_requests: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub window: Duration,

    /// Tokens added per refill interval. Token bucket only; defaults to 1.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub refill_rate: Option<u32>,

    /// Token bucket only; defaults to `window / max_requests`.
    #[serde(default, with = "humantime_serde")]
    pub refill_interval: Option<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::api()
    }
}

impl RateLimitConfig {
    pub fn new(algorithm: Algorithm, max_requests: u32, window: Duration) -> Self {
        Self {
            algorithm,
            max_requests,
            window,
            refill_rate: None,
            refill_interval: None,
        }
    }

    pub fn token_bucket(capacity: u32, window: Duration) -> Self {
        Self::new(Algorithm::TokenBucket, capacity, window)
    }

    pub fn sliding_window(max_requests: u32, window: Duration) -> Self {
        Self::new(Algorithm::SlidingWindow, max_requests, window)
    }

    pub fn fixed_window(max_requests: u32, window: Duration) -> Self {
        Self::new(Algorithm::FixedWindow, max_requests, window)
    }

    pub fn with_refill(mut self, rate: u32, interval: Duration) -> Self {
        self.refill_rate = Some(rate);
        self.refill_interval = Some(interval);
        self
    }

    /// Search-as-you-type: smooth limit over a short moving window.
    pub fn search() -> Self {
        Self::sliding_window(10, Duration::from_secs(1))
    }

    /// Payment-like actions: strict, cheap, discrete windows.
    pub fn payment() -> Self {
        Self::fixed_window(3, Duration::from_secs(60))
    }

    /// General API traffic: bursts up to capacity, steady refill.
    pub fn api() -> Self {
        Self::token_bucket(60, Duration::from_secs(60))
    }

    pub fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate.unwrap_or(1).max(1)
    }

    pub fn refill_interval_ms(&self) -> u64 {
        match self.refill_interval {
            Some(interval) => (interval.as_millis() as u64).max(1),
            None => (self.window_ms() / u64::from(self.max_requests.max(1))).max(1),
        }
    }
}
