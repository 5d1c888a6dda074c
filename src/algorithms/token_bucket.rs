use super::{LimiterState, RateLimitStatus};
use crate::rate_limit_config::RateLimitConfig;

/// Token bucket with discrete refills.
///
/// Tokens are only added when a whole refill interval has elapsed, and
/// `last_refill_at` advances by whole intervals so partial progress towards
/// the next refill is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_rate: u32,
    refill_interval_ms: u64,
    last_refill_at: u64,
    last_used_at: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: u32, refill_interval_ms: u64, now: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate: refill_rate.max(1),
            refill_interval_ms: refill_interval_ms.max(1),
            last_refill_at: now,
            last_used_at: now,
        }
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn last_refill_at(&self) -> u64 {
        self.last_refill_at
    }

    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill_at);
        let intervals = elapsed / self.refill_interval_ms;
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(u64::from(self.refill_rate));
        let tokens = u64::from(self.tokens).saturating_add(added);
        self.tokens = tokens.min(u64::from(self.capacity)) as u32;
        self.last_refill_at += intervals * self.refill_interval_ms;
    }

    /// Milliseconds until `needed` more tokens have been refilled.
    fn time_until(&self, needed: u32, now: u64) -> u64 {
        if needed == 0 {
            return 0;
        }
        let intervals = u64::from(needed).div_ceil(u64::from(self.refill_rate));
        (self.last_refill_at + intervals * self.refill_interval_ms).saturating_sub(now)
    }
}

impl LimiterState for TokenBucket {
    fn from_config(config: &RateLimitConfig, now: u64) -> Self {
        Self::new(
            config.max_requests,
            config.refill_rate(),
            config.refill_interval_ms(),
            now,
        )
    }

    fn reconfigure(&mut self, config: &RateLimitConfig) {
        self.capacity = config.max_requests;
        self.refill_rate = config.refill_rate();
        self.refill_interval_ms = config.refill_interval_ms();
        self.tokens = self.tokens.min(self.capacity);
    }

    fn evaluate(&mut self, now: u64, consume: bool) -> RateLimitStatus {
        self.refill(now);
        if consume {
            self.last_used_at = now;
        }

        if self.tokens >= 1 {
            if consume {
                self.tokens -= 1;
            }
            let until_full = self.time_until(self.capacity - self.tokens, now);
            RateLimitStatus::allowed(self.tokens, now + until_full)
        } else {
            let retry_after = self.time_until(1 - self.tokens, now);
            RateLimitStatus::denied(now + retry_after.max(1), retry_after)
        }
    }

    fn is_idle(&self, now: u64, idle_ttl_ms: u64) -> bool {
        let mut probe = self.clone();
        probe.refill(now);
        probe.tokens == probe.capacity && now.saturating_sub(self.last_used_at) >= idle_ttl_ms
    }
}
