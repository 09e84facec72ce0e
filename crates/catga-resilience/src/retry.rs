//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use catga_common::telemetry::counters;
use catga_common::{CatgaError, CatgaResult};

/// Exponential-backoff retry policy.
///
/// Only errors whose kind is retryable (`Unavailable`, `Timeout`) are
/// retried; everything else returns immediately. The delay before attempt
/// `n + 1` is `min(cap, base * 2^(n-1))` scaled by a jitter factor drawn
/// uniformly from [0.5, 1.5].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The closure receives the 1-based attempt
    /// number.
    pub async fn run<T, F, Fut>(&self, op: F) -> CatgaResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CatgaResult<T>>,
    {
        self.run_cancellable(&CancellationToken::new(), op).await
    }

    /// Like [`RetryPolicy::run`], but stops (with `Cancelled`) as soon as
    /// `cancel` fires, including mid-backoff.
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> CatgaResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CatgaResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(CatgaError::cancelled());
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= attempts {
                        if attempt > 1 {
                            warn!(
                                attempts = attempt,
                                error = %err,
                                "giving up after retries"
                            );
                        }
                        return Err(err);
                    }

                    let delay = self.backoff_for(attempt);
                    debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after backoff"
                    );
                    metrics::counter!(counters::RESILIENCE_RETRIES).increment(1);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CatgaError::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self
            .base
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let capped = raw.min(self.cap);
        if self.jitter {
            let factor = rand::rng().random_range(0.5..=1.5);
            Duration::from_secs_f64(capped.as_secs_f64() * factor)
        } else {
            capped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .without_jitter()
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(3)
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CatgaError>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy(5)
            .run(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CatgaError::unavailable("transport_down", "try later"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_exceeds_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: CatgaResult<()> = fast_policy(4)
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CatgaError::timeout("deadline", "too slow")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: CatgaResult<()> = fast_policy(5)
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CatgaError::validation("bad_input", "no")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let result: CatgaResult<()> = fast_policy(5)
            .run_cancellable(&token, |_| async {
                Err(CatgaError::unavailable("transport_down", "try later"))
            })
            .await;
        assert_eq!(
            result.unwrap_err().kind(),
            catga_common::ErrorKind::Cancelled
        );
    }

    #[test]
    fn backoff_obeys_base_and_cap() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(400),
        )
        .without_jitter();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(8), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..200 {
            let delay = policy.backoff_for(1);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }
}
