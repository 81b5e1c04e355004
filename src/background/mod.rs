//! Background tasks — fire-and-forget cache fills that never block a response.
//!
//! Every cache write triggered while serving runs as its own Tokio task. The
//! caller gets its response as soon as the upstream fetch finishes; the write
//! completes (or fails and is logged) on its own time. [`FillQueue`] keeps the
//! handles so a host can wait for quiescence, e.g. before shutdown or in tests.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::warn;

/// Tracks spawned cache-fill tasks.
///
/// Dropping the queue aborts fills that have not finished yet; an aborted
/// fill never commits a partial entry.
#[derive(Debug, Default)]
pub struct FillQueue {
    tasks: Mutex<JoinSet<()>>,
}

impl FillQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` onto the current Tokio runtime.
    ///
    /// Finished tasks are reaped on each call so the set does not grow
    /// without bound on a long-running host.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.spawn(task);
    }

    /// Number of fills spawned but not yet reaped.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Waits until every fill spawned so far (and any spawned meanwhile) has finished.
    pub async fn drain(&self) {
        loop {
            let mut batch = std::mem::take(&mut *self.lock());
            if batch.is_empty() {
                return;
            }
            while let Some(result) = batch.join_next().await {
                log_join_result(result);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "cache fill task panicked");
        }
    }
}
