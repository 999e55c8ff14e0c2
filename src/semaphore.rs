//! Named binary semaphores with cooperative shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::thread::ThreadId;

/// Key protecting head advancement and log-set mutation for one thread.
pub(crate) fn thread_update(id: &ThreadId) -> String {
    format!("tu:{id}")
}

/// Holding this guard means owning the named semaphore.
#[derive(Debug)]
pub struct SemaphoreGuard {
    _permit: OwnedSemaphorePermit,
}

/// Lazily created binary semaphores keyed by string.
///
/// A stopped pool refuses new acquisitions with [`Error::Stopped`]; waiters
/// blocked at stop time observe the same error. [`SemaphorePool::stop`] is
/// idempotent and waits for all outstanding holders to release.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    inner: Mutex<HashMap<String, Arc<Semaphore>>>,
    stop: CancellationToken,
}

impl SemaphorePool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the semaphore named `key` is free.
    pub async fn acquire(&self, key: impl Into<String>) -> Result<SemaphoreGuard> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        let sem = {
            let mut inner = self.inner.lock();
            inner
                .entry(key.into())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        tokio::select! {
            _ = self.stop.cancelled() => Err(Error::Stopped),
            permit = sem.acquire_owned() => {
                let permit = permit.map_err(|_| Error::Stopped)?;
                Ok(SemaphoreGuard { _permit: permit })
            }
        }
    }

    /// Denies new acquisitions and waits for current holders to release.
    pub async fn stop(&self) {
        self.stop.cancel();
        let sems: Vec<_> = self.inner.lock().values().cloned().collect();
        for sem in sems {
            // drains to the holder; the permit is released immediately
            let _ = sem.acquire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_key() {
        let pool = Arc::new(SemaphorePool::new());
        let guard = pool.acquire("a").await.unwrap();

        let p2 = pool.clone();
        let waiter = tokio::spawn(async move { p2.acquire("a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_overlap() {
        let pool = SemaphorePool::new();
        let _a = pool.acquire("a").await.unwrap();
        let _b = pool.acquire("b").await.unwrap();
    }

    #[tokio::test]
    async fn stop_refuses_and_waits() {
        let pool = Arc::new(SemaphorePool::new());
        let guard = pool.acquire("a").await.unwrap();

        let p2 = pool.clone();
        let stopper = tokio::spawn(async move { p2.stop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !stopper.is_finished(),
            "stop must wait for the outstanding holder"
        );
        assert!(matches!(pool.acquire("b").await, Err(Error::Stopped)));

        drop(guard);
        stopper.await.unwrap();
        // idempotent
        pool.stop().await;
        assert!(matches!(pool.acquire("a").await, Err(Error::Stopped)));
    }
}
