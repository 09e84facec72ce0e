//! Built-in pipeline behaviors.
//!
//! Each is individually switchable on the builder; the declared stage order
//! decides nesting. The core rejects an order where Retry wraps Idempotency,
//! so a retried request can never be double-counted as processed.

mod idempotency;
mod logging;
mod retry;
mod tracing;
mod validation;

pub use idempotency::{IdempotencyBehavior, IdempotencyOptions};
pub use logging::LoggingBehavior;
pub use retry::RetryBehavior;
pub use tracing::TracingBehavior;
pub use validation::ValidationBehavior;
