//! FIFO concurrency limiter with scoped release.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use catga_common::{CatgaError, CatgaResult};

/// Bounded slot pool. Waiters are served in FIFO order; a waiter cancelled
/// mid-wait leaves no slot behind.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
}

/// RAII slot; dropping it releases the slot back to the pool.
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Wait for a slot. tokio semaphores queue waiters fairly, so arrival
    /// order is acquisition order.
    pub async fn acquire(&self) -> CatgaResult<ConcurrencyPermit> {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Ok(ConcurrencyPermit { _permit: permit }),
            Err(_) => Err(CatgaError::unavailable(
                "limiter_closed",
                "concurrency limiter has been shut down",
            )),
        }
    }

    /// Wait for a slot unless `cancel` fires first, in which case the call
    /// returns `Cancelled` and no slot is consumed.
    pub async fn acquire_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> CatgaResult<ConcurrencyPermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CatgaError::cancelled()),
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(ConcurrencyPermit { _permit: permit }),
                Err(_) => Err(CatgaError::unavailable(
                    "limiter_closed",
                    "concurrency limiter has been shut down",
                )),
            },
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
