//! Loading-state tracker for user-initiated operations.
//!
//! Guards against duplicate submissions and supervises each operation with a
//! timeout. State is exposed through `watch` channels so UI code can bind to
//! a per-key flag, the active count, or the aggregate "anything loading" flag.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{MonotonicClock, SharedClock};
use crate::config::Settings;
use crate::error::OperationTimeout;

pub type TimeoutCallback = Arc<dyn Fn(&OperationTimeout) + Send + Sync>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call options for [`OperationTracker::start_loading`].
#[derive(Clone, Default)]
pub struct LoadingConfig {
    /// `None` uses the tracker default; zero disables the timeout.
    pub timeout: Option<Duration>,
    pub category: Option<String>,
    pub on_timeout: Option<TimeoutCallback>,
}

impl LoadingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = Some(Duration::ZERO);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OperationTimeout) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for LoadingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingConfig")
            .field("timeout", &self.timeout)
            .field("category", &self.category)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

struct LoadingOperation {
    id: Uuid,
    started_at: u64,
    timeout: Option<JoinHandle<()>>,
    category: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    operations: HashMap<String, LoadingOperation>,
    flags: HashMap<String, watch::Sender<bool>>,
}

impl TrackerState {
    fn set_flag(&mut self, key: &str, loading: bool) {
        if let Some(flag) = self.flags.get(key) {
            flag.send_replace(loading);
            if flag.receiver_count() == 0 {
                self.flags.remove(key);
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<LoadingOperation> {
        let operation = self.operations.remove(key)?;
        self.set_flag(key, false);
        Some(operation)
    }
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    active: watch::Sender<usize>,
    any: watch::Sender<bool>,
    clock: SharedClock,
    default_timeout: Duration,
}

impl TrackerInner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &TrackerState) {
        let count = state.operations.len();
        self.active.send_replace(count);
        self.any.send_replace(count > 0);
    }

    /// Remove `key` if it is still the operation identified by `id`.
    fn finish(&self, key: &str, id: Uuid) -> Option<LoadingOperation> {
        let mut state = self.state();
        if state.operations.get(key).map(|op| op.id) != Some(id) {
            return None;
        }
        let operation = state.remove(key);
        self.publish(&state);
        operation
    }
}

/// Registry of named loading operations.
///
/// Cloning is cheap; clones share state. Arming a timeout spawns a tokio
/// task, so operations with a timeout must be started inside a runtime.
#[derive(Clone)]
pub struct OperationTracker {
    inner: Arc<TrackerInner>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self::build(clock, DEFAULT_TIMEOUT)
    }

    pub fn from_settings(settings: &Settings, clock: SharedClock) -> Self {
        Self::build(clock, settings.loading_timeout)
    }

    fn build(clock: SharedClock, default_timeout: Duration) -> Self {
        let (active, _) = watch::channel(0);
        let (any, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                active,
                any,
                clock,
                default_timeout,
            }),
        }
    }

    /// Mark `key` as loading. Returns false if it already is.
    pub fn start_loading(&self, key: &str, config: &LoadingConfig) -> bool {
        self.start(key, config).is_some()
    }

    fn start(&self, key: &str, config: &LoadingConfig) -> Option<Uuid> {
        let mut state = self.inner.state();
        if state.operations.contains_key(key) {
            debug!(key = %key, "Rejected duplicate start");
            return None;
        }

        let id = Uuid::new_v4();
        let timeout = config.timeout.unwrap_or(self.inner.default_timeout);
        let handle = (!timeout.is_zero()).then(|| self.arm_timeout(key, id, timeout, config.on_timeout.clone()));

        state.operations.insert(
            key.to_string(),
            LoadingOperation {
                id,
                started_at: self.inner.clock.now_ms(),
                timeout: handle,
                category: config.category.clone(),
            },
        );
        state.set_flag(key, true);
        self.inner.publish(&state);
        debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "Started loading");
        Some(id)
    }

    fn arm_timeout(
        &self,
        key: &str,
        id: Uuid,
        timeout: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> JoinHandle<()> {
        let inner: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let Some(operation) = inner.finish(&key, id) else {
                return;
            };

            let elapsed = inner.clock.now_ms().saturating_sub(operation.started_at);
            let timeout = OperationTimeout {
                key,
                elapsed: Duration::from_millis(elapsed),
            };
            warn!(key = %timeout.key, elapsed_ms = elapsed, "Loading operation timed out");
            if let Some(callback) = on_timeout {
                callback(&timeout);
            }
        })
    }

    /// Clear `key`. Calling it for a key that is not loading is a no-op.
    pub fn stop_loading(&self, key: &str) -> bool {
        let mut state = self.inner.state();
        let Some(operation) = state.remove(key) else {
            return false;
        };
        if let Some(timeout) = operation.timeout {
            timeout.abort();
        }
        self.inner.publish(&state);
        debug!(key = %key, "Stopped loading");
        true
    }

    /// Stop every operation tagged with `category`.
    pub fn stop_by_category(&self, category: &str) -> usize {
        self.stop_where(|op| op.category.as_deref() == Some(category))
    }

    pub fn stop_all(&self) -> usize {
        self.stop_where(|_| true)
    }

    fn stop_where(&self, matches: impl Fn(&LoadingOperation) -> bool) -> usize {
        let mut state = self.inner.state();
        let keys: Vec<String> = state
            .operations
            .iter()
            .filter(|(_, op)| matches(op))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(timeout) = state.remove(key).and_then(|op| op.timeout) {
                timeout.abort();
            }
        }
        self.inner.publish(&state);
        if !keys.is_empty() {
            debug!(count = keys.len(), "Stopped loading operations");
        }
        keys.len()
    }

    /// Start `key`, run `f`, then stop `key`. Returns `None` without calling
    /// `f` if `key` is already loading.
    pub async fn with_loading<F, Fut, R>(&self, key: &str, f: F, config: &LoadingConfig) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.begin(key, config)?;
        let result = f().await;
        drop(guard);
        Some(result)
    }

    /// Start `key` and return a guard that stops it when dropped.
    pub fn begin(&self, key: &str, config: &LoadingConfig) -> Option<LoadingGuard> {
        let id = self.start(key, config)?;
        Some(LoadingGuard {
            tracker: self.clone(),
            key: key.to_string(),
            id,
        })
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.inner.state().operations.contains_key(key)
    }

    /// Observe the loading flag of `key`.
    pub fn subscribe(&self, key: &str) -> watch::Receiver<bool> {
        let mut state = self.inner.state();
        let loading = state.operations.contains_key(key);
        state
            .flags
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(loading).0)
            .subscribe()
    }

    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    pub fn subscribe_active_count(&self) -> watch::Receiver<usize> {
        self.inner.active.subscribe()
    }

    pub fn any_loading(&self) -> bool {
        *self.inner.any.borrow()
    }

    pub fn subscribe_any_loading(&self) -> watch::Receiver<bool> {
        self.inner.any.subscribe()
    }
}

/// Stops its operation on drop, unless it was already stopped or replaced.
pub struct LoadingGuard {
    tracker: OperationTracker,
    key: String,
    id: Uuid,
}

impl LoadingGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        if let Some(timeout) = self.tracker.inner.finish(&self.key, self.id).and_then(|op| op.timeout) {
            timeout.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let tracker = OperationTracker::new();
        let config = LoadingConfig::default();

        assert!(tracker.start_loading("x", &config));
        assert!(!tracker.start_loading("x", &config));
        assert!(tracker.stop_loading("x"));
        assert!(!tracker.stop_loading("x"));
        assert!(tracker.start_loading("x", &config));
    }

    #[tokio::test]
    async fn test_counts_and_aggregate_flag() {
        let tracker = OperationTracker::new();
        let config = LoadingConfig::default();
        assert!(!tracker.any_loading());

        tracker.start_loading("a", &config);
        tracker.start_loading("b", &config);
        assert_eq!(tracker.active_count(), 2);
        assert!(tracker.any_loading());

        tracker.stop_loading("a");
        assert_eq!(tracker.active_count(), 1);
        tracker.stop_loading("b");
        assert_eq!(tracker.active_count(), 0);
        assert!(!tracker.any_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_force_stops_and_calls_back() {
        let tracker = OperationTracker::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&fired);
        let config = LoadingConfig::new()
            .with_timeout(Duration::from_millis(100))
            .on_timeout(move |timeout| seen.lock().unwrap().push(timeout.clone()));

        assert!(tracker.start_loading("upload", &config));
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(tracker.is_loading("upload"));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!tracker.is_loading("upload"));
        assert_eq!(tracker.active_count(), 0);

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].key, "upload");
        assert_eq!(fired[0].elapsed, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disarms_timeout() {
        let tracker = OperationTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let short = LoadingConfig::new()
            .with_timeout(Duration::from_millis(100))
            .on_timeout(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });

        tracker.start_loading("save", &short);
        tracker.stop_loading("save");
        tracker.start_loading("save", &LoadingConfig::new().with_timeout(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(tracker.is_loading("save"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_loading_rejects_duplicate() {
        let tracker = OperationTracker::new();
        let config = LoadingConfig::default();
        let calls = AtomicUsize::new(0);

        tracker.start_loading("submit", &config);
        let result = tracker
            .with_loading("submit", || async { calls.fetch_add(1, Ordering::SeqCst) }, &config)
            .await;
        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tracker.stop_loading("submit");
        let result = tracker.with_loading("submit", || async { 42 }, &config).await;
        assert_eq!(result, Some(42));
        assert!(!tracker.is_loading("submit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_loading_stops_when_future_is_dropped() {
        let tracker = OperationTracker::new();
        let task = tokio::spawn({
            let tracker = tracker.clone();
            async move {
                tracker
                    .with_loading("export", || std::future::pending::<()>(), &LoadingConfig::default())
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(tracker.is_loading("export"));

        task.abort();
        let _ = task.await;
        assert!(!tracker.is_loading("export"));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_guard_does_not_stop_restarted_operation() {
        let tracker = OperationTracker::new();
        let config = LoadingConfig::default();

        let guard = tracker.begin("sync", &config).unwrap();
        tracker.stop_loading("sync");
        tracker.start_loading("sync", &config);
        drop(guard);

        assert!(tracker.is_loading("sync"));
    }

    #[tokio::test]
    async fn test_stop_by_category() {
        let tracker = OperationTracker::new();
        let checkout = LoadingConfig::new().with_category("checkout");

        tracker.start_loading("pay", &checkout);
        tracker.start_loading("address", &checkout);
        tracker.start_loading("search", &LoadingConfig::default());

        assert_eq!(tracker.stop_by_category("checkout"), 2);
        assert!(!tracker.is_loading("pay"));
        assert!(tracker.is_loading("search"));
        assert_eq!(tracker.active_count(), 1);

        assert_eq!(tracker.stop_all(), 1);
        assert!(!tracker.any_loading());
    }

    #[tokio::test]
    async fn test_observables_reflect_writes_immediately() {
        let tracker = OperationTracker::new();
        let flag = tracker.subscribe("x");
        let count = tracker.subscribe_active_count();
        let any = tracker.subscribe_any_loading();
        assert!(!*flag.borrow());

        tracker.start_loading("x", &LoadingConfig::default());
        assert!(*flag.borrow());
        assert_eq!(*count.borrow(), 1);
        assert!(*any.borrow());

        tracker.stop_loading("x");
        assert!(!*flag.borrow());
        assert_eq!(*count.borrow(), 0);
        assert!(!*any.borrow());
    }
}
