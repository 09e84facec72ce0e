//! Bounded concurrency with a bounded wait queue.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use catga_common::{CatgaError, CatgaResult};

/// At most `max_concurrency` callers run at once; at most `max_queue`
/// callers wait for a slot. Anyone beyond that fails fast with
/// `unavailable`/`bulkhead_full`.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_queue: usize,
    waiting: AtomicUsize,
}

/// RAII slot; dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl Bulkhead {
    pub fn new(max_concurrency: usize, max_queue: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_queue,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Acquire a slot, waiting in FIFO order if the queue has room.
    pub async fn acquire(&self) -> CatgaResult<BulkheadPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { _permit: permit });
        }

        // Reserve a queue position before waiting; the fetch_add itself is
        // the admission check so concurrent overflows cannot slip through.
        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        if queued >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(CatgaError::unavailable(
                "bulkhead_full",
                "bulkhead concurrency and wait queue are exhausted",
            ));
        }

        let result = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(_) => Err(CatgaError::unavailable(
                "bulkhead_closed",
                "bulkhead has been shut down",
            )),
        }
    }

    /// Run `op` inside a slot.
    pub async fn run<T, F, Fut>(&self, op: F) -> CatgaResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatgaResult<T>>,
    {
        let _permit = self.acquire().await?;
        op().await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn limits_concurrency() {
        let bulkhead = Arc::new(Bulkhead::new(2, 10));
        let p1 = bulkhead.acquire().await.unwrap();
        let _p2 = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.available(), 0);

        drop(p1);
        assert_eq!(bulkhead.available(), 1);
    }

    #[tokio::test]
    async fn overflow_fails_fast() {
        let bulkhead = Arc::new(Bulkhead::new(1, 1));
        let _held = bulkhead.acquire().await.unwrap();

        // One waiter fits in the queue.
        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The next caller overflows.
        let err = bulkhead.acquire().await.unwrap_err();
        assert_eq!(err.code(), "bulkhead_full");

        drop(_held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_releases_on_completion() {
        let bulkhead = Bulkhead::new(1, 0);
        bulkhead.run(|| async { Ok::<_, CatgaError>(()) }).await.unwrap();
        bulkhead.run(|| async { Ok::<_, CatgaError>(()) }).await.unwrap();
        assert_eq!(bulkhead.available(), 1);
    }
}
