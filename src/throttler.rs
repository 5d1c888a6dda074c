use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use tracing::info;
use validator::Validate;

use crate::cancel::CancelSignal;
use crate::clock::{MonotonicClock, SharedClock};
use crate::config::Settings;
use crate::coordinator::{CoordinatorStats, RequestCoordinator};
use crate::error::{CoordinatorError, RequestError, Result};
use crate::policy::ExecutionPolicy;
use crate::rate_limit_config::RateLimitConfig;
use crate::rate_limiter::{LimiterStats, RateLimiter};
use crate::sweeper::{spawn_sweeper, SweeperHandle};
use crate::tracker::OperationTracker;

/// Boxed executor, handy when executors are chosen at runtime.
pub type BoxedExecutor<T> = Box<dyn Fn(CancelSignal) -> BoxFuture<'static, std::result::Result<T, RequestError>> + Send + Sync>;

/// Owns the rate limiter, request coordinator and operation tracker for one
/// application, plus the background sweepers that keep their registries
/// bounded.
pub struct Throttler<T> {
    rate_limiter: RateLimiter,
    coordinator: RequestCoordinator<T>,
    tracker: OperationTracker,
    settings: Settings,
    sweepers: Vec<SweeperHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThrottlerStats {
    pub rate_limiter: LimiterStats,
    pub coordinator: CoordinatorStats,
    pub active_operations: usize,
}

impl<T> Throttler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a throttler and start its sweepers. Must be called from within
    /// a tokio runtime.
    pub fn start(settings: Settings) -> Result<Self> {
        Self::start_with_clock(settings, MonotonicClock::shared())
    }

    pub fn start_with_clock(settings: Settings, clock: SharedClock) -> Result<Self> {
        settings.validate()?;

        let rate_limiter = RateLimiter::from_settings(&settings, clock.clone());
        let coordinator = RequestCoordinator::with_clock(clock.clone());
        let tracker = OperationTracker::from_settings(&settings, clock);

        let sweepers = vec![
            spawn_sweeper(rate_limiter.clone(), settings.sweep_interval),
            spawn_sweeper(coordinator.clone(), settings.sweep_interval),
        ];

        info!(
            sweep_interval_ms = settings.sweep_interval.as_millis() as u64,
            idle_ttl_ms = settings.rate_limit_idle_ttl.as_millis() as u64,
            "Throttler started"
        );

        Ok(Self {
            rate_limiter,
            coordinator,
            tracker,
            settings,
            sweepers,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn coordinator(&self) -> &RequestCoordinator<T> {
        &self.coordinator
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute under the default policy from settings.
    pub async fn execute<F, Fut>(&self, key: &str, executor: F) -> std::result::Result<T, CoordinatorError>
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, RequestError>> + Send + 'static,
    {
        self.coordinator
            .execute(key, executor, &self.settings.default_policy)
            .await
    }

    /// Consult the rate limiter, then the coordinator.
    ///
    /// A live cached value or a blocked key is answered without spending a
    /// slot. When the
    /// limiter denies the call the executor is not run and
    /// [`CoordinatorError::RateLimited`] carries the suggested wait.
    pub async fn execute_limited<F, Fut>(
        &self,
        key: &str,
        limit: &RateLimitConfig,
        executor: F,
        policy: &ExecutionPolicy,
    ) -> std::result::Result<T, CoordinatorError>
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, RequestError>> + Send + 'static,
    {
        if policy.cache_enabled() {
            if let Some(data) = self.coordinator.cached(key) {
                return Ok(data);
            }
        }

        if self.coordinator.is_blocked(key) {
            return Err(CoordinatorError::Blocked { key: key.to_string() });
        }

        let status = self.rate_limiter.check_and_consume(key, limit)?;
        if !status.allowed {
            return Err(CoordinatorError::RateLimited {
                key: key.to_string(),
                retry_after_ms: status.retry_after.unwrap_or_default(),
            });
        }

        self.coordinator.execute(key, executor, policy).await
    }

    pub fn stats(&self) -> Result<ThrottlerStats> {
        Ok(ThrottlerStats {
            rate_limiter: self.rate_limiter.stats()?,
            coordinator: self.coordinator.stats(),
            active_operations: self.tracker.active_count(),
        })
    }

    /// Stop the sweepers, cancel in-flight executions and stop every loading
    /// operation.
    pub async fn shutdown(mut self) {
        for sweeper in self.sweepers.drain(..) {
            sweeper.shutdown().await;
        }
        let cancelled = self.coordinator.cancel_all();
        let stopped = self.tracker.stop_all();
        info!(cancelled, stopped, "Throttler shut down");
    }
}
