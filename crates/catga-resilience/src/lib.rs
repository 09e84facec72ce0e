//! Resilience primitives used around handler execution and I/O.
//!
//! Each primitive is usable standalone and side-effect-free when the wrapped
//! action is:
//!
//! - [`RetryPolicy`]: exponential backoff with jitter, transient kinds only
//! - [`CircuitBreaker`]: closed/open/half-open with a single trial probe
//! - [`Bulkhead`]: bounded concurrency with a bounded wait queue
//! - [`ConcurrencyLimiter`]: FIFO slot acquisition with scoped release
//! - [`RateLimiter`]: quota-based throttling

mod bulkhead;
mod circuit_breaker;
mod limiter;
mod rate_limiter;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use limiter::{ConcurrencyLimiter, ConcurrencyPermit};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
