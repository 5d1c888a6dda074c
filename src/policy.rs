use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call policy for the request coordinator.
///
/// A zero `cache_ttl` or `throttle` disables that stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub deduplicate: bool,
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::ZERO,
            deduplicate: true,
            throttle: Duration::ZERO,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1000),
        }
    }
}

impl ExecutionPolicy {
    pub fn cached(ttl: Duration) -> Self {
        Self::default().with_cache_ttl(ttl)
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    pub fn cache_enabled(&self) -> bool {
        !self.cache_ttl.is_zero()
    }

    pub fn throttle_enabled(&self) -> bool {
        !self.throttle.is_zero()
    }

    /// `retry_base_delay * 2^attempt`, where attempt 0 is the first retry.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_base_delay.saturating_mul(factor)
    }
}
