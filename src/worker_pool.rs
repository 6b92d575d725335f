//! Bounded worker pool for auxiliary bulk work.
//!
//! Caps outbound concurrency (mostly processing engine calls) when a job
//! fans out over many owners.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

pub const DEFAULT_POOL_CAP: usize = 50;

#[derive(Debug, Clone)]
pub struct BoundedPool {
    permits: Arc<Semaphore>,
    cap: usize,
}

impl BoundedPool {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            permits: Arc::new(Semaphore::new(cap)),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Run `task` for every item with at most `cap` futures in flight.
    ///
    /// Results come back in completion order. Panicked tasks are logged and
    /// left out of the result.
    pub async fn run_all<I, T, F, Fut>(&self, items: I, task: F) -> Vec<Fut::Output>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let mut set = JoinSet::new();

        for item in items {
            let permits = Arc::clone(&self.permits);
            let fut = task(item);
            set.spawn(async move {
                // The semaphore is never closed, so acquire only fails on a bug.
                let _permit = permits.acquire_owned().await.ok();
                fut.await
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(output) => results.push(output),
                Err(e) => error!(error = %e, "Worker pool task failed"),
            }
        }
        results
    }
}

impl Default for BoundedPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAP)
    }
}
