//! Request coordinator.
//!
//! Every call for a key passes, in order, through: blocked check, cache,
//! in-flight deduplication, throttle coalescing and finally execution with
//! retries. Registry mutations happen under a lock that is never held across
//! an await, so each transition is atomic with respect to other callers.

use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{self, CancelHandle, CancelSignal};
use crate::clock::{duration_ms, MonotonicClock, SharedClock};
use crate::error::{CoordinatorError, RequestError};
use crate::metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
use crate::policy::ExecutionPolicy;
use crate::sweeper::Sweep;

type Outcome<T> = Result<T, CoordinatorError>;
type ExecutorFuture<T> = BoxFuture<'static, Result<T, RequestError>>;
type SharedExecutor<T> = Arc<dyn Fn(CancelSignal) -> ExecutorFuture<T> + Send + Sync>;
type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct CacheEntry<T> {
    data: T,
    captured_at: u64,
    expires_at: u64,
}

struct PendingOperation<T> {
    id: Uuid,
    outcome: SharedOutcome<T>,
    cancel: CancelHandle,
    started_at: u64,
}

/// Single deferred execution shared by every caller that hit the throttle.
struct CoalescedWaiter<T> {
    executor: SharedExecutor<T>,
    policy: ExecutionPolicy,
    outcome: SharedOutcome<T>,
    cancel: CancelHandle,
    callers: usize,
}

struct ThrottleState<T> {
    last_executed_at: Option<u64>,
    throttle_ms: u64,
    waiter: Option<CoalescedWaiter<T>>,
}

impl<T> ThrottleState<T> {
    fn new(throttle_ms: u64) -> Self {
        Self {
            last_executed_at: None,
            throttle_ms,
            waiter: None,
        }
    }
}

struct Registry<T> {
    cache: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, Vec<PendingOperation<T>>>,
    throttles: HashMap<String, ThrottleState<T>>,
    blocked: HashMap<String, u64>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            pending: HashMap::new(),
            throttles: HashMap::new(),
            blocked: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    fn remove_pending(&mut self, key: &str, id: Uuid) {
        if let Some(ops) = self.pending.get_mut(key) {
            ops.retain(|op| op.id != id);
            if ops.is_empty() {
                self.pending.remove(key);
            }
        }
    }

    fn first_pending(&self, key: &str) -> Option<&PendingOperation<T>> {
        self.pending.get(key).and_then(|ops| ops.first())
    }

    /// Cancels pending executions and the coalesced waiter for `key`.
    fn cancel_key(&mut self, key: &str) -> bool {
        let mut cancelled = false;
        if let Some(ops) = self.pending.remove(key) {
            for op in ops {
                op.cancel.cancel();
                cancelled = true;
            }
        }
        if let Some(waiter) = self.throttles.get_mut(key).and_then(|state| state.waiter.take()) {
            waiter.cancel.cancel();
            cancelled = true;
        }
        cancelled
    }

    fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pending.keys().cloned().collect();
        for (key, state) in &self.throttles {
            if state.waiter.is_some() && !self.pending.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

enum Admission<T> {
    Ready(T),
    Wait(SharedOutcome<T>),
}

enum CoalesceStep<T> {
    AwaitPending(SharedOutcome<T>),
    Sleep(Duration),
    Started(SharedOutcome<T>),
}

/// Registry sizes plus outcome counters.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub cache_entries: usize,
    pub pending_keys: usize,
    pub throttled_keys: usize,
    pub blocked_keys: usize,
    pub metrics: CoordinatorMetricsSnapshot,
}

/// Deduplicates, caches, throttles and retries async operations by key.
///
/// Cloning is cheap and every clone shares the same registries. Executions
/// run on spawned tokio tasks, so bookkeeping is cleared even if every
/// caller stops waiting.
pub struct RequestCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    registry: Mutex<Registry<T>>,
    clock: SharedClock,
    metrics: CoordinatorMetrics,
}

impl<T> Default for RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                clock,
                metrics: CoordinatorMetrics::default(),
            }),
        }
    }

    /// Run `executor` for `key` under `policy`.
    ///
    /// The executor receives a [`CancelSignal`] and may be invoked more than
    /// once when retries are enabled.
    pub async fn execute<F, Fut>(&self, key: &str, executor: F, policy: &ExecutionPolicy) -> Outcome<T>
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let executor: SharedExecutor<T> = Arc::new(move |signal| executor(signal).boxed());
        match self.inner.admit(key, executor, policy)? {
            Admission::Ready(data) => Ok(data),
            Admission::Wait(outcome) => outcome.await,
        }
    }

    /// Reject every call for `key` until `duration` has passed.
    pub fn block_key(&self, key: &str, duration: Duration) {
        let until = self.inner.clock.now_ms().saturating_add(duration_ms(duration));
        self.inner.registry().blocked.insert(key.to_string(), until);
        info!(key = %key, duration_ms = duration_ms(duration), "Blocked key");
    }

    pub fn unblock_key(&self, key: &str) -> bool {
        self.inner.registry().blocked.remove(key).is_some()
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        let now = self.inner.clock.now_ms();
        self.inner
            .registry()
            .blocked
            .get(key)
            .is_some_and(|&until| now < until)
    }

    /// Signal cancellation to the executions for `key` and drop their
    /// bookkeeping. Returns false if nothing was in flight.
    pub fn cancel(&self, key: &str) -> bool {
        let cancelled = self.inner.registry().cancel_key(key);
        if cancelled {
            CoordinatorMetrics::incr(&self.inner.metrics.cancellations);
            info!(key = %key, "Cancelled operation");
        }
        cancelled
    }

    /// Cancel every in-flight key matching `pattern`, returning the number of
    /// keys cancelled.
    pub fn cancel_matching(&self, pattern: &Regex) -> usize {
        self.cancel_where(|key| pattern.is_match(key))
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut registry = self.inner.registry();
        let mut count = 0;
        for key in registry.active_keys() {
            if matches(&key) && registry.cancel_key(&key) {
                CoordinatorMetrics::incr(&self.inner.metrics.cancellations);
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "Cancelled operations");
        }
        count
    }

    /// Live cached value for `key`, if any.
    pub fn cached(&self, key: &str) -> Option<T> {
        let now = self.inner.clock.now_ms();
        self.inner
            .registry()
            .cache
            .get(key)
            .filter(|entry| now <= entry.expires_at)
            .map(|entry| entry.data.clone())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.registry().cache.remove(key).is_some()
    }

    pub fn invalidate_matching(&self, pattern: &Regex) -> usize {
        let mut registry = self.inner.registry();
        let before = registry.cache.len();
        registry.cache.retain(|key, _| !pattern.is_match(key));
        before - registry.cache.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.registry().pending.contains_key(key)
    }

    /// Number of keys with an execution in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.registry().pending.len()
    }

    /// Cancel everything in flight and empty every registry.
    pub fn clear(&self) {
        let cancelled = self.cancel_all();
        *self.inner.registry() = Registry::default();
        debug!(cancelled, "Cleared coordinator registries");
    }

    pub fn stats(&self) -> CoordinatorStats {
        let registry = self.inner.registry();
        CoordinatorStats {
            cache_entries: registry.cache.len(),
            pending_keys: registry.pending.len(),
            throttled_keys: registry.throttles.len(),
            blocked_keys: registry.blocked.len(),
            metrics: self.inner.metrics.snapshot(),
        }
    }

    /// Drop expired cache entries, expired blocks and throttle states with
    /// no waiter whose window has elapsed. Pending operations are never
    /// touched; they clear themselves when they settle.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let mut guard = self.inner.registry();
        let registry = &mut *guard;
        let before = registry.cache.len() + registry.blocked.len() + registry.throttles.len();

        registry.cache.retain(|_, entry| now <= entry.expires_at);
        registry.blocked.retain(|_, until| now < *until);
        let pending = &registry.pending;
        registry.throttles.retain(|key, state| {
            state.waiter.is_some()
                || pending.contains_key(key)
                || state
                    .last_executed_at
                    .is_some_and(|at| now.saturating_sub(at) < state.throttle_ms)
        });

        before - (registry.cache.len() + registry.blocked.len() + registry.throttles.len())
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(self: &Arc<Self>, key: &str, executor: SharedExecutor<T>, policy: &ExecutionPolicy) -> Outcome<Admission<T>> {
        let now = self.clock.now_ms();
        let mut guard = self.registry();
        let registry = &mut *guard;

        if let Some(&until) = registry.blocked.get(key) {
            if now < until {
                CoordinatorMetrics::incr(&self.metrics.blocked);
                debug!(key = %key, blocked_for_ms = until - now, "Rejected call for blocked key");
                return Err(CoordinatorError::Blocked { key: key.to_string() });
            }
            registry.blocked.remove(key);
        }

        let expired = match registry.cache.get(key) {
            Some(entry) if now <= entry.expires_at => {
                CoordinatorMetrics::incr(&self.metrics.cache_hits);
                debug!(key = %key, age_ms = now - entry.captured_at, "Cache hit");
                return Ok(Admission::Ready(entry.data.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            registry.cache.remove(key);
        }

        if policy.deduplicate {
            if let Some(op) = registry.first_pending(key) {
                CoordinatorMetrics::incr(&self.metrics.deduplicated);
                debug!(key = %key, in_flight_ms = now.saturating_sub(op.started_at), "Joined in-flight execution");
                return Ok(Admission::Wait(op.outcome.clone()));
            }
        }

        if policy.throttle_enabled() {
            let throttle_ms = duration_ms(policy.throttle);
            let in_flight = registry.pending.contains_key(key);
            let state = registry
                .throttles
                .entry(key.to_string())
                .or_insert_with(|| ThrottleState::new(throttle_ms));
            state.throttle_ms = throttle_ms;

            if let Some(waiter) = state.waiter.as_mut() {
                waiter.executor = executor;
                waiter.policy = policy.clone();
                waiter.callers += 1;
                CoordinatorMetrics::incr(&self.metrics.coalesced);
                debug!(key = %key, callers = waiter.callers, "Coalesced into throttled execution");
                return Ok(Admission::Wait(waiter.outcome.clone()));
            }

            let within_window = state
                .last_executed_at
                .is_some_and(|at| now.saturating_sub(at) < throttle_ms);
            if in_flight || within_window {
                let (cancel, signal) = cancel::pair();
                let task = tokio::spawn(Arc::clone(self).run_coalesced(key.to_string(), signal));
                let outcome = join_outcome(task);
                state.waiter = Some(CoalescedWaiter {
                    executor,
                    policy: policy.clone(),
                    outcome: outcome.clone(),
                    cancel,
                    callers: 1,
                });
                CoordinatorMetrics::incr(&self.metrics.coalesced);
                debug!(key = %key, throttle_ms, in_flight, "Throttled; deferring execution");
                return Ok(Admission::Wait(outcome));
            }
        }

        Ok(Admission::Wait(self.start_execution(registry, key, executor, policy.clone(), now)))
    }

    /// Spawn an execution and install its pending entry before anything can
    /// observe the key again.
    fn start_execution(
        self: &Arc<Self>,
        registry: &mut Registry<T>,
        key: &str,
        executor: SharedExecutor<T>,
        policy: ExecutionPolicy,
        now: u64,
    ) -> SharedOutcome<T> {
        let id = Uuid::new_v4();
        let (cancel, signal) = cancel::pair();
        CoordinatorMetrics::incr(&self.metrics.executions);

        let task = tokio::spawn(Arc::clone(self).run(key.to_string(), id, executor, policy, signal));
        let outcome = join_outcome(task);
        registry
            .pending
            .entry(key.to_string())
            .or_default()
            .push(PendingOperation {
                id,
                outcome: outcome.clone(),
                cancel,
                started_at: now,
            });
        outcome
    }

    async fn run(
        self: Arc<Self>,
        key: String,
        id: Uuid,
        executor: SharedExecutor<T>,
        policy: ExecutionPolicy,
        signal: CancelSignal,
    ) -> Outcome<T> {
        let result = self.execute_with_retry(&key, &executor, &policy, &signal).await;

        let now = self.clock.now_ms();
        let mut guard = self.registry();
        let registry = &mut *guard;
        registry.remove_pending(&key, id);

        match &result {
            Ok(data) if !signal.is_cancelled() => {
                if policy.throttle_enabled() {
                    let throttle_ms = duration_ms(policy.throttle);
                    registry
                        .throttles
                        .entry(key.clone())
                        .or_insert_with(|| ThrottleState::new(throttle_ms))
                        .last_executed_at = Some(now);
                }
                if policy.cache_enabled() {
                    registry.cache.insert(
                        key.clone(),
                        CacheEntry {
                            data: data.clone(),
                            captured_at: now,
                            expires_at: now.saturating_add(duration_ms(policy.cache_ttl)),
                        },
                    );
                }
            }
            Ok(_) => {}
            Err(e) if e.is_abort() => {}
            Err(_) => CoordinatorMetrics::incr(&self.metrics.failures),
        }

        result
    }

    async fn execute_with_retry(
        &self,
        key: &str,
        executor: &SharedExecutor<T>,
        policy: &ExecutionPolicy,
        signal: &CancelSignal,
    ) -> Outcome<T> {
        let aborted = || CoordinatorError::Aborted { key: key.to_string() };
        let mut attempt: u32 = 0;

        loop {
            if signal.is_cancelled() {
                return Err(aborted());
            }

            let err = match (executor.as_ref())(signal.clone()).await {
                Ok(data) => return Ok(data),
                Err(err) => err,
            };

            if err.is_abort() || signal.is_cancelled() {
                debug!(key = %key, "Execution aborted");
                return Err(aborted());
            }
            if err.is_permanent() {
                debug!(key = %key, error = %err, "Execution rejected by the server");
                return Err(err.into());
            }
            if !err.is_transient() {
                debug!(key = %key, error = %err, "Execution failed with unclassified error");
                return Err(err.into());
            }
            if attempt >= policy.max_retries {
                if policy.max_retries > 0 {
                    warn!(key = %key, attempts = attempt + 1, error = %err, "Retries exhausted");
                }
                return Err(err.into());
            }

            let delay = policy.backoff_delay(attempt);
            attempt += 1;
            CoordinatorMetrics::incr(&self.metrics.retries);
            warn!(
                key = %key,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = duration_ms(delay),
                error = %err,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(aborted()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Waits out any in-flight execution and the throttle window, then runs
    /// whichever executor the most recent caller supplied.
    async fn run_coalesced(self: Arc<Self>, key: String, signal: CancelSignal) -> Outcome<T> {
        let aborted = || CoordinatorError::Aborted { key: key.clone() };

        loop {
            let step = {
                let now = self.clock.now_ms();
                let mut guard = self.registry();
                let registry = &mut *guard;

                let in_flight = registry.first_pending(&key).map(|op| op.outcome.clone());
                if let Some(outcome) = in_flight {
                    CoalesceStep::AwaitPending(outcome)
                } else {
                    let Some(state) = registry.throttles.get_mut(&key) else {
                        return Err(aborted());
                    };
                    let ready_at = state
                        .last_executed_at
                        .map_or(now, |at| at.saturating_add(state.throttle_ms));
                    if ready_at > now {
                        CoalesceStep::Sleep(Duration::from_millis(ready_at - now))
                    } else {
                        let Some(waiter) = state.waiter.take() else {
                            return Err(aborted());
                        };
                        debug!(key = %key, callers = waiter.callers, "Running coalesced execution");
                        let outcome = self.start_execution(registry, &key, waiter.executor, waiter.policy, now);
                        CoalesceStep::Started(outcome)
                    }
                }
            };

            match step {
                CoalesceStep::AwaitPending(outcome) => {
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(aborted()),
                        _ = outcome => {}
                    }
                }
                CoalesceStep::Sleep(delay) => {
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(aborted()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                CoalesceStep::Started(outcome) => return outcome.await,
            }
        }
    }
}

fn join_outcome<T>(task: JoinHandle<Outcome<T>>) -> SharedOutcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    async move {
        task.await
            .unwrap_or_else(|e| Err(CoordinatorError::Internal(format!("execution task failed: {}", e))))
    }
    .boxed()
    .shared()
}

impl<T> Sweep for RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "request_coordinator"
    }

    fn sweep(&self) -> crate::error::Result<usize> {
        Ok(RequestCoordinator::sweep(self))
    }
}
