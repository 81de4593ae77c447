//! Owned background tasks sharing one cancellation token.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Set of background tasks that are stopped together
///
/// Each task receives a child of the shared token and is expected to return
/// once it is cancelled. `shutdown` cancels the token and joins every task.
#[derive(Debug, Default)]
pub struct BackgroundWorkers {
    token: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BackgroundWorkers {
    /// Create an empty worker set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the workers; cancelled on shutdown
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a worker onto the current tokio runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime, like `tokio::spawn`.
    pub fn spawn<F, Fut>(&self, name: &'static str, worker: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(worker(self.token()));
        debug!(worker = name, "Background worker started");

        let mut handles = self.handles.lock();
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.push((name, handle));
    }

    /// Number of workers that have not finished yet
    #[must_use]
    pub fn running(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every worker and wait for all of them to finish
    pub async fn shutdown(&self) {
        self.token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(worker = name, error = %e, "Background worker did not exit cleanly");
            }
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
