//! Build-phase registration.
//!
//! Handlers, behaviors and batchers are declared on the builder; `build()`
//! composes each request type's pipeline from the declared stage order and
//! freezes the registry. Nothing about dispatch changes after that.

use std::future::Future;
use std::sync::Arc;

use catga_codec::AnyCodec;
use catga_common::{CatgaError, CatgaResult, Event, MessageContext, Request};
use catga_resilience::RetryPolicy;
use catga_store::{DeadLetterStore, IdempotencyStore};

use crate::batch::{BatchHandler, BatchOptions, BatchScheduler, KeyFn};
use crate::behaviors::{
    IdempotencyBehavior, IdempotencyOptions, LoggingBehavior, RetryBehavior, TracingBehavior,
    ValidationBehavior,
};
use crate::mediator::{Catga, MediatorOptions};
use crate::pipeline::{compose, terminal, Behavior};
use crate::registry::{
    EventHandler, EventInvoker, FnEventHandler, FnRequestHandler, HandlerRegistry, RequestHandler,
};

/// Built-in pipeline stages, named for ordering declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorStage {
    Tracing,
    Logging,
    Validation,
    Idempotency,
    Retry,
}

#[derive(Clone)]
pub(crate) struct IdempotencyConfig {
    pub(crate) store: Arc<dyn IdempotencyStore>,
    pub(crate) options: IdempotencyOptions,
}

#[derive(Clone)]
pub(crate) struct PipelineConfig {
    pub(crate) stages: Vec<BehaviorStage>,
    pub(crate) logging: bool,
    pub(crate) tracing: bool,
    pub(crate) validation: bool,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) idempotency: Option<IdempotencyConfig>,
    pub(crate) codec: AnyCodec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                BehaviorStage::Tracing,
                BehaviorStage::Logging,
                BehaviorStage::Validation,
                BehaviorStage::Idempotency,
                BehaviorStage::Retry,
            ],
            logging: true,
            tracing: true,
            validation: true,
            retry: None,
            idempotency: None,
            codec: AnyCodec::json(),
        }
    }
}

fn build_behaviors<R: Request>(config: &PipelineConfig) -> Vec<Arc<dyn Behavior<R>>> {
    let mut behaviors: Vec<Arc<dyn Behavior<R>>> = Vec::new();
    for stage in &config.stages {
        match stage {
            BehaviorStage::Tracing => {
                if config.tracing {
                    behaviors.push(Arc::new(TracingBehavior::new()));
                }
            }
            BehaviorStage::Logging => {
                if config.logging {
                    behaviors.push(Arc::new(LoggingBehavior::new()));
                }
            }
            BehaviorStage::Validation => {
                if config.validation {
                    behaviors.push(Arc::new(ValidationBehavior::new()));
                }
            }
            BehaviorStage::Idempotency => {
                if let Some(idem) = &config.idempotency {
                    behaviors.push(Arc::new(IdempotencyBehavior::new(
                        idem.store.clone(),
                        config.codec,
                        idem.options.clone(),
                    )));
                }
            }
            BehaviorStage::Retry => {
                if let Some(policy) = &config.retry {
                    behaviors.push(Arc::new(RetryBehavior::new(policy.clone())));
                }
            }
        }
    }
    behaviors
}

type Deferred = Box<dyn FnOnce(&PipelineConfig, &mut HandlerRegistry) + Send>;

/// Registration surface for [`Catga`].
pub struct CatgaBuilder {
    registry: HandlerRegistry,
    deferred: Vec<Deferred>,
    pipeline: PipelineConfig,
    event_parallelism: usize,
    event_retry: Option<RetryPolicy>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
}

impl Default for CatgaBuilder {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::default(),
            deferred: Vec::new(),
            pipeline: PipelineConfig::default(),
            event_parallelism: 8,
            event_retry: None,
            dead_letters: None,
        }
    }
}

impl CatgaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    /// Register the handler for `R`. Registering a second handler for the
    /// same type replaces the first.
    pub fn register_request_handler<R, H>(self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        self.register_request_handler_with_behaviors::<R, H>(handler, Vec::new())
    }

    /// Register a request handler plus behaviors that run innermost, after
    /// the built-in stages.
    pub fn register_request_handler_with_behaviors<R, H>(
        mut self,
        handler: H,
        extra: Vec<Arc<dyn Behavior<R>>>,
    ) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let handler: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.deferred.push(Box::new(move |config, registry| {
            let mut behaviors = build_behaviors::<R>(config);
            behaviors.extend(extra);
            registry.insert_request::<R>(compose(terminal(handler), behaviors));
        }));
        self
    }

    /// Closure form of [`CatgaBuilder::register_request_handler`].
    pub fn register_request_fn<R, F, Fut>(self, f: F) -> Self
    where
        R: Request,
        F: Fn(R, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CatgaResult<R::Response>> + Send + 'static,
    {
        self.register_request_handler::<R, _>(FnRequestHandler::new(f))
    }

    /// Add one handler for `E`. Handlers are invoked in registration order.
    pub fn register_event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let name = catga_common::short_type_name::<H>().to_string();
        let handler = Arc::new(handler);
        let invoker: EventInvoker<E> = Arc::new(move |event, ctx| {
            let handler = handler.clone();
            Box::pin(async move { handler.handle(event, &ctx).await })
        });
        self.registry.insert_event::<E>(invoker, name);
        self
    }

    /// Closure form of [`CatgaBuilder::register_event_handler`].
    pub fn register_event_fn<E, F, Fut>(self, f: F) -> Self
    where
        E: Event,
        F: Fn(E, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CatgaResult<()>> + Send + 'static,
    {
        self.register_event_handler::<E, _>(FnEventHandler::new(f))
    }

    /// Route `R` through the auto-batching scheduler instead of the
    /// per-request pipeline. All requests land in one shard.
    pub fn register_batch_handler<R, H>(self, handler: H, options: BatchOptions) -> Self
    where
        R: Request,
        H: BatchHandler<R>,
    {
        self.insert_batcher::<R>(Arc::new(handler), options, None)
    }

    /// Batch registration with a per-request shard key.
    pub fn register_batch_handler_with_key<R, H, K>(
        self,
        handler: H,
        options: BatchOptions,
        key_fn: K,
    ) -> Self
    where
        R: Request,
        H: BatchHandler<R>,
        K: Fn(&R) -> String + Send + Sync + 'static,
    {
        self.insert_batcher::<R>(Arc::new(handler), options, Some(Arc::new(key_fn)))
    }

    fn insert_batcher<R: Request>(
        mut self,
        handler: Arc<dyn BatchHandler<R>>,
        options: BatchOptions,
        key_fn: Option<KeyFn<R>>,
    ) -> Self {
        let scheduler = Arc::new(BatchScheduler::new(handler, options, key_fn));
        self.registry.insert_batcher::<R>(scheduler);
        self
    }

    // ------------------------------------------------------------------
    // Pipeline configuration
    // ------------------------------------------------------------------

    /// Declare the stage order, outermost first.
    pub fn with_pipeline_stages(mut self, stages: Vec<BehaviorStage>) -> Self {
        self.pipeline.stages = stages;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.pipeline.logging = enabled;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.pipeline.tracing = enabled;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.pipeline.validation = enabled;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.pipeline.retry = Some(policy);
        self
    }

    pub fn with_idempotency(
        mut self,
        store: Arc<dyn IdempotencyStore>,
        options: IdempotencyOptions,
    ) -> Self {
        self.pipeline.idempotency = Some(IdempotencyConfig { store, options });
        self
    }

    pub fn with_codec(mut self, codec: AnyCodec) -> Self {
        self.pipeline.codec = codec;
        self
    }

    // ------------------------------------------------------------------
    // Event dispatch configuration
    // ------------------------------------------------------------------

    /// Bounded fan-out degree for event handlers of one event.
    pub fn with_event_parallelism(mut self, degree: usize) -> Self {
        self.event_parallelism = degree.max(1);
        self
    }

    pub fn with_event_retry(mut self, policy: RetryPolicy) -> Self {
        self.event_retry = Some(policy);
        self
    }

    /// Sink for event-handler failures that exhausted their retries.
    pub fn with_dead_letters(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    // ------------------------------------------------------------------
    // Build
    // ------------------------------------------------------------------

    /// Freeze the registry and produce the mediator.
    ///
    /// Fails when the declared stage order lets Retry wrap Idempotency:
    /// a retried execution would then re-run a request that replay should
    /// have answered.
    pub fn build(mut self) -> CatgaResult<Catga> {
        let idempotency_pos = self
            .pipeline
            .stages
            .iter()
            .position(|s| *s == BehaviorStage::Idempotency);
        let retry_pos = self
            .pipeline
            .stages
            .iter()
            .position(|s| *s == BehaviorStage::Retry);
        if self.pipeline.idempotency.is_some() && self.pipeline.retry.is_some() {
            match (idempotency_pos, retry_pos) {
                (Some(idem), Some(retry)) if idem > retry => {
                    return Err(CatgaError::validation(
                        "pipeline_order",
                        "Idempotency must wrap Retry; declare it earlier in the stage order",
                    ));
                }
                _ => {}
            }
        }

        for register in self.deferred.drain(..) {
            register(&self.pipeline, &mut self.registry);
        }

        Ok(Catga::new(
            Arc::new(self.registry),
            MediatorOptions {
                event_parallelism: self.event_parallelism,
                event_retry: self.event_retry,
                dead_letters: self.dead_letters,
                codec: self.pipeline.codec,
                validate_batched: self.pipeline.validation,
            },
        ))
    }
}
