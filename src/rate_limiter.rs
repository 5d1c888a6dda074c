use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use validator::Validate;

use crate::algorithms::{FixedWindow, LimiterState, RateLimitStatus, SlidingWindow, TokenBucket};
use crate::clock::{duration_ms, MonotonicClock, SharedClock};
use crate::config::Settings;
use crate::error::{Result, ThrottlerError};
use crate::metrics::{LimiterMetrics, LimiterMetricsSnapshot};
use crate::rate_limit_config::{Algorithm, RateLimitConfig};
use crate::sweeper::Sweep;

const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Client-side rate limiter keyed by operation key.
///
/// The algorithm is chosen per call through [`RateLimitConfig`]; each
/// algorithm keeps its own registry, so one key can be limited by several
/// algorithms independently.
#[derive(Clone)]
pub struct RateLimiter {
    registry: Arc<Mutex<Registry>>,
    clock: SharedClock,
    idle_ttl_ms: u64,
    metrics: Arc<LimiterMetrics>,
}

#[derive(Default)]
struct Registry {
    token_buckets: HashMap<String, TokenBucket>,
    sliding_windows: HashMap<String, SlidingWindow>,
    fixed_windows: HashMap<String, FixedWindow>,
}

/// Entry counts per algorithm plus decision counters.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub token_buckets: usize,
    pub sliding_windows: usize,
    pub fixed_windows: usize,
    pub metrics: LimiterMetricsSnapshot,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            clock,
            idle_ttl_ms: duration_ms(Settings::default().rate_limit_idle_ttl),
            metrics: Arc::new(LimiterMetrics::default()),
        }
    }

    pub fn from_settings(settings: &Settings, clock: SharedClock) -> Self {
        Self::with_clock(clock).with_idle_ttl(settings.rate_limit_idle_ttl)
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl_ms = duration_ms(idle_ttl);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| ThrottlerError::InternalError("Failed to acquire lock on rate limit registry".to_string()))
    }

    /// Check the limit for `key` and consume a slot if allowed.
    pub fn check_and_consume(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        let status = self.evaluate(key, config, true)?;
        self.metrics.record(status.allowed);
        if !status.allowed {
            debug!(
                key = %key,
                algorithm = %config.algorithm,
                retry_after_ms = status.retry_after.unwrap_or_default(),
                "Rate limit exceeded"
            );
        }
        Ok(status)
    }

    /// Check the limit for `key` without consuming or creating state.
    pub fn check(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitStatus> {
        self.evaluate(key, config, false)
    }

    fn evaluate(&self, key: &str, config: &RateLimitConfig, consume: bool) -> Result<RateLimitStatus> {
        config.validate()?;
        let now = self.clock.now_ms();
        let mut registry = self.lock()?;

        let status = match config.algorithm {
            Algorithm::TokenBucket => evaluate_in(&mut registry.token_buckets, key, config, now, consume),
            Algorithm::SlidingWindow => evaluate_in(&mut registry.sliding_windows, key, config, now, consume),
            Algorithm::FixedWindow => evaluate_in(&mut registry.fixed_windows, key, config, now, consume),
        };
        Ok(status)
    }

    /// Wait until a slot is granted for `key`, giving up after `max_wait`.
    ///
    /// Sleeps for the reported `retry_after` between attempts. Returns `true`
    /// once a slot has been consumed. The whole wait counts as one decision
    /// in the limiter metrics.
    pub async fn wait_for_slot(&self, key: &str, config: &RateLimitConfig, max_wait: Duration) -> Result<bool> {
        let deadline = self.clock.now_ms().saturating_add(duration_ms(max_wait));

        loop {
            let status = self.evaluate(key, config, true)?;
            if status.allowed {
                self.metrics.record(true);
                return Ok(true);
            }

            let remaining = deadline.saturating_sub(self.clock.now_ms());
            if remaining == 0 {
                self.metrics.record(false);
                debug!(key = %key, max_wait_ms = duration_ms(max_wait), "Gave up waiting for rate limit slot");
                return Ok(false);
            }

            let retry_after = status.retry_after.unwrap_or_default();
            let pause = retry_after.max(MIN_POLL_INTERVAL_MS).min(remaining);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    /// Reset rate limit state for a specific key under every algorithm.
    pub fn reset(&self, key: &str) -> Result<bool> {
        let mut registry = self.lock()?;
        let removed = registry.token_buckets.remove(key).is_some()
            | registry.sliding_windows.remove(key).is_some()
            | registry.fixed_windows.remove(key).is_some();
        Ok(removed)
    }

    pub fn reset_all(&self) -> Result<()> {
        let mut registry = self.lock()?;
        *registry = Registry::default();
        self.metrics.reset();
        Ok(())
    }

    /// Remove entries whose removal is indistinguishable from keeping them:
    /// empty sliding windows, elapsed fixed windows and full token buckets
    /// untouched for the idle TTL.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let idle_ttl_ms = self.idle_ttl_ms;
        let mut registry = self.lock()?;

        let before = registry.len();
        registry.token_buckets.retain(|_, state| !state.is_idle(now, idle_ttl_ms));
        registry.sliding_windows.retain(|_, state| !state.is_idle(now, idle_ttl_ms));
        registry.fixed_windows.retain(|_, state| !state.is_idle(now, idle_ttl_ms));

        Ok(before - registry.len())
    }

    /// Get statistics about the rate limiter
    pub fn stats(&self) -> Result<LimiterStats> {
        let registry = self.lock()?;
        Ok(LimiterStats {
            token_buckets: registry.token_buckets.len(),
            sliding_windows: registry.sliding_windows.len(),
            fixed_windows: registry.fixed_windows.len(),
            metrics: self.metrics.snapshot(),
        })
    }
}

impl Registry {
    fn len(&self) -> usize {
        self.token_buckets.len() + self.sliding_windows.len() + self.fixed_windows.len()
    }
}

fn evaluate_in<S: LimiterState>(
    states: &mut HashMap<String, S>,
    key: &str,
    config: &RateLimitConfig,
    now: u64,
    consume: bool,
) -> RateLimitStatus {
    if consume {
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| S::from_config(config, now));
        state.reconfigure(config);
        return state.evaluate(now, true);
    }

    let mut probe = match states.get(key) {
        Some(state) => state.clone(),
        None => S::from_config(config, now),
    };
    probe.reconfigure(config);
    probe.evaluate(now, false)
}

impl Sweep for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn sweep(&self) -> Result<usize> {
        RateLimiter::sweep(self)
    }
}
