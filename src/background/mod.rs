//! Background tasks — detached work that outlives the request that started it.
//!
//! Stale-while-revalidate refreshes, trimming, network-first fetches, and
//! prefetches run here. The caller never waits for them, but
//! [`BackgroundTasks::shutdown`] does: it is the barrier that lets every
//! in-flight cache write and trim finish before the process exits. Once the
//! barrier starts, [`BackgroundTasks::spawn`] hands the work back instead of
//! detaching it.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A cloneable handle to the manager's set of detached tasks.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    // Held for reading while spawning, for writing while closing, so no task
    // is admitted after the barrier has counted what it waits for.
    gate: Arc<RwLock<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` on the current Tokio runtime and tracks it until it completes.
    ///
    /// # Errors
    ///
    /// Returns `task` unstarted once [`shutdown`](Self::shutdown) has begun.
    /// The caller decides whether to run it inline or drop it.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, F>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let _open = self.gate.read();
        if self.tracker.is_closed() {
            return Err(task);
        }
        Ok(self.tracker.spawn(task))
    }

    /// Number of tracked tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has begun.
    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Refuses new tasks, then waits for every tracked one.
    pub async fn shutdown(&self) {
        {
            let _closing = self.gate.write();
            self.tracker.close();
        }
        debug!(pending = self.tracker.len(), "waiting for background tasks");
        self.tracker.wait().await;
    }
}
