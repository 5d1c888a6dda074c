use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Keyed trailing-edge debounce.
///
/// Each `call` replaces whatever was scheduled for the key, so only the last
/// action supplied within `delay` runs.
#[derive(Clone, Default)]
pub struct Debouncer {
    scheduled: Arc<Mutex<HashMap<String, (Uuid, JoinHandle<()>)>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn scheduled(&self) -> MutexGuard<'_, HashMap<String, (Uuid, JoinHandle<()>)>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `action` to run after `delay`, superseding any earlier call
    /// for `key` that has not fired yet.
    pub fn call<F, Fut>(&self, key: &str, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let scheduled = Arc::clone(&self.scheduled);
        let owned_key = key.to_string();
        // held until the entry is installed so the task always finds it
        let mut entries = self.scheduled();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut scheduled = scheduled.lock().unwrap_or_else(PoisonError::into_inner);
                if !scheduled.get(&owned_key).is_some_and(|(current, _)| *current == id) {
                    return;
                }
                scheduled.remove(&owned_key);
            }
            action().await;
        });

        if let Some((_, previous)) = entries.insert(key.to_string(), (id, task)) {
            previous.abort();
            debug!(key = %key, "Debounced call superseded");
        }
    }

    /// Drop the scheduled call for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.scheduled().remove(key) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of keys with a call waiting to fire.
    pub fn pending(&self) -> usize {
        self.scheduled().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_only_last_call_runs() {
        let debouncer = Debouncer::new();
        let last = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        for i in 1..=5 {
            let last = Arc::clone(&last);
            let runs = Arc::clone(&runs);
            debouncer.call("search", Duration::from_millis(300), move || async move {
                last.store(i, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);

        debouncer.call("save", Duration::from_millis(50), move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(debouncer.cancel("save"));
        assert!(!debouncer.cancel("save"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
