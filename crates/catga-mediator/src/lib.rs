//! The mediator: typed request/event dispatch through a composable pipeline.
//!
//! - [`HandlerRegistry`]: type-keyed, frozen-after-build handler table
//! - [`Behavior`]: cross-cutting interceptors composed at build time
//! - [`Catga`]: the single public dispatch facade
//! - [`BatchScheduler`]: per-type sharded auto-batching
//!
//! Handlers are registered on a [`CatgaBuilder`]; after `build()` the
//! dispatch tables are read-only and lookups are a single map probe.

pub mod batch;
pub mod behaviors;
pub mod builder;
pub mod mediator;
pub mod pipeline;
pub mod registry;

pub use batch::{BatchHandler, BatchOptions};
pub use behaviors::{
    IdempotencyBehavior, IdempotencyOptions, LoggingBehavior, RetryBehavior, TracingBehavior,
    ValidationBehavior,
};
pub use builder::{BehaviorStage, CatgaBuilder};
pub use mediator::{Catga, PublishOptions, SendOptions};
pub use pipeline::{Behavior, Next};
pub use registry::{EventHandler, HandlerRegistry, RequestHandler};
