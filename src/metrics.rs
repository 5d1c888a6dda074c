use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Allowed/denied counters for the rate limiter.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterMetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
}

impl LimiterMetrics {
    pub fn record(&self, allowed: bool) {
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LimiterMetricsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let denied = self.denied.load(Ordering::Relaxed);
        LimiterMetricsSnapshot {
            total_requests: allowed + denied,
            allowed_requests: allowed,
            denied_requests: denied,
        }
    }

    pub fn reset(&self) {
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
    }
}

/// Counters describing how the coordinator resolved calls.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub(crate) executions: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) deduplicated: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) cancellations: AtomicU64,
    pub(crate) blocked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMetricsSnapshot {
    pub executions: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub coalesced: u64,
    pub retries: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub blocked: u64,
}

impl CoordinatorMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}
