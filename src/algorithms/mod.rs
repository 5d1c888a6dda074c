//! Rate limiting algorithms module
//!
//! Each algorithm is a plain per-key state machine driven by an explicit
//! `now` in milliseconds. The [`RateLimiter`](crate::rate_limiter::RateLimiter)
//! owns the registries and picks the algorithm per call.

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::rate_limit_config::RateLimitConfig;
use serde::Serialize;

/// Result of a rate limit check.
///
/// `reset_at` is a timestamp on the limiter's clock. `retry_after` is present
/// iff the request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    pub fn allowed(remaining: u32, reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub fn denied(reset_at: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after.max(1)),
        }
    }
}

/// Per-key state of a rate limiting algorithm.
pub trait LimiterState: Clone + Send {
    /// Fresh state for a key seen for the first time at `now`.
    fn from_config(config: &RateLimitConfig, now: u64) -> Self;

    /// Applies a changed config to existing state without losing history.
    fn reconfigure(&mut self, config: &RateLimitConfig);

    /// Evaluates a request at `now`, recording it when `consume` is set and
    /// the request is allowed.
    fn evaluate(&mut self, now: u64, consume: bool) -> RateLimitStatus;

    /// True when dropping the state is indistinguishable from keeping it.
    fn is_idle(&self, now: u64, idle_ttl_ms: u64) -> bool;
}
