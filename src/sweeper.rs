//! Background sweep task.
//!
//! Registries are swept on a fixed interval until the returned
//! [`SweeperHandle`] is shut down or dropped.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A registry with entries that can expire while nobody looks at them.
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Removes idle or expired entries, returning how many were removed.
    /// Must never remove an entry that an in-flight operation still refers to.
    fn sweep(&self) -> Result<usize>;
}

pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweep loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawn a task sweeping `target` every `period`. Must be called from within
/// a tokio runtime.
pub fn spawn_sweeper<S: Sweep>(target: S, period: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        info!(target_name = target.name(), period_ms = period.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match target.sweep() {
                        Ok(0) => {}
                        Ok(removed) => debug!(target_name = target.name(), removed, "Swept idle entries"),
                        Err(e) => warn!(target_name = target.name(), error = %e, "Sweep failed"),
                    }
                }
            }
        }

        info!(target_name = target.name(), "Sweeper stopped");
    });

    SweeperHandle {
        shutdown_tx,
        task: Some(task),
    }
}
