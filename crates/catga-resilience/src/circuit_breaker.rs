//! Circuit breaker protecting downstream dependencies.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use catga_common::{CatgaError, CatgaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time to wait in Open before probing with a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Closed/Open/HalfOpen breaker.
///
/// After `failure_threshold` consecutive failures the breaker opens; once
/// `cooldown` has elapsed a single trial call is admitted. The trial decides:
/// success closes the breaker, failure re-opens it. Concurrent callers during
/// the trial fail fast -- exactly one caller wins the probe slot.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    trial_in_flight: AtomicBool,
    last_failure_time: RwLock<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            last_failure_time: RwLock::new(None),
            config,
        }
    }

    /// Check whether a call may proceed right now.
    ///
    /// In HalfOpen at most one caller gets `true` until the trial resolves.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_failure = *self.last_failure_time.read();
                let cooled_down = last_failure
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return false;
                }
                *self.state.write() = CircuitState::HalfOpen;
                debug!("circuit breaker transitioning to half-open");
                self.claim_trial()
            }
            CircuitState::HalfOpen => self.claim_trial(),
        }
    }

    fn claim_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn record_success(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Closed;
                self.failure_count.store(0, Ordering::SeqCst);
                self.trial_in_flight.store(false, Ordering::Release);
                info!("circuit breaker closed after successful trial");
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.last_failure_time.write() = Some(Instant::now());
                    warn!(failures = count, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Open;
                *self.last_failure_time.write() = Some(Instant::now());
                self.trial_in_flight.store(false, Ordering::Release);
                warn!("circuit breaker re-opened on failed trial");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Run `op` under the breaker. Rejected calls fail fast with
    /// `unavailable`/`circuit_open`.
    pub async fn run<T, F, Fut>(&self, op: F) -> CatgaResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatgaResult<T>>,
    {
        if !self.allow_request() {
            return Err(CatgaError::unavailable(
                "circuit_open",
                "circuit breaker is open",
            ));
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                // Only transient failures count against the breaker.
                if err.is_retryable() {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(err)
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let cb = breaker(3, 1_000);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = breaker(3, 1_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn exactly_one_trial_in_half_open() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Cooldown of zero: first caller claims the trial, the rest are
        // rejected until the trial resolves.
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn failed_trial_reopens() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn run_rejects_when_open() {
        let cb = breaker(1, 60_000);
        let _: CatgaResult<()> = cb
            .run(|| async { Err(CatgaError::unavailable("down", "down")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.run(|| async { Ok(1) }).await.unwrap_err();
        assert_eq!(err.code(), "circuit_open");
    }

    #[tokio::test]
    async fn non_transient_errors_do_not_trip() {
        let cb = breaker(1, 60_000);
        let _: CatgaResult<()> = cb
            .run(|| async { Err(CatgaError::validation("bad", "bad")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
