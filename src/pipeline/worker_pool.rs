//! Bounded pool for work too slow for a connection task.
//!
//! Blocking closures run on tokio's blocking threads; a semaphore caps how
//! many run at once so a burst of slow validators or endpoints cannot exhaust
//! the blocking thread budget. Results come back through the awaited handle,
//! and the caller applies them to request state on its own task.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure on a pool thread and await its result.
    pub async fn run_blocking<F, T>(&self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Unhandled("worker pool is closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Worker pool task failed");
            PipelineError::Unhandled(format!("worker task failed: {}", e))
        })
    }

    /// Run a future as its own task, bounded by the same permits.
    pub async fn spawn<F>(&self, work: F) -> Result<F::Output, PipelineError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Unhandled("worker pool is closed".into()))?;

        tokio::spawn(async move {
            let _permit = permit;
            work.await
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Worker pool task failed");
            PipelineError::Unhandled(format!("worker task failed: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_blocking_work_in_parallel() {
        let pool = WorkerPool::new(8);
        let started = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.run_blocking(|| {
                        std::thread::sleep(Duration::from_millis(200));
                        std::thread::current().id()
                    })
                    .await
                    .unwrap()
                })
            })
            .collect();

        let mut threads = HashSet::new();
        for handle in handles {
            threads.insert(handle.await.unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(1200));
        assert!(threads.len() > 1);
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    async fn panics_become_unhandled_errors() {
        let pool = WorkerPool::new(1);
        let err = pool.run_blocking(|| -> u8 { panic!("boom") }).await.unwrap_err();
        assert!(matches!(err, PipelineError::Unhandled(_)));
        assert_eq!(pool.run_blocking(|| 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn zero_size_still_runs() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.spawn(async { 3 }).await.unwrap(), 3);
    }
}
