//! Type-keyed handler registry.
//!
//! Built once by [`crate::CatgaBuilder`], read-only afterwards. Each request
//! type maps to its pre-composed pipeline; each event type maps to its
//! handlers in registration order. Runtime lookup is one map probe plus a
//! downcast of the stored invoker, so there is no per-call reflection.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use catga_common::{CatgaResult, Event, MessageContext, Request};

use crate::pipeline::PipelineFn;

/// Handles one request type; exactly one handler per type.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: R, ctx: &MessageContext) -> CatgaResult<R::Response>;
}

/// Handles one event type; any number of handlers per type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: E, ctx: &MessageContext) -> CatgaResult<()>;
}

/// Closure adapter for request handlers.
pub(crate) struct FnRequestHandler<R, F> {
    f: F,
    _marker: PhantomData<fn(R)>,
}

impl<R, F> FnRequestHandler<R, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<R, F, Fut> RequestHandler<R> for FnRequestHandler<R, F>
where
    R: Request,
    F: Fn(R, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CatgaResult<R::Response>> + Send + 'static,
{
    async fn handle(&self, request: R, ctx: &MessageContext) -> CatgaResult<R::Response> {
        (self.f)(request, ctx.clone()).await
    }
}

/// Closure adapter for event handlers.
pub(crate) struct FnEventHandler<E, F> {
    f: F,
    _marker: PhantomData<fn(E)>,
}

impl<E, F> FnEventHandler<E, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnEventHandler<E, F>
where
    E: Event,
    F: Fn(E, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CatgaResult<()>> + Send + 'static,
{
    async fn handle(&self, event: E, ctx: &MessageContext) -> CatgaResult<()> {
        (self.f)(event, ctx.clone()).await
    }
}

/// Type-erased invoker for one event handler.
pub(crate) type EventInvoker<E> =
    Arc<dyn Fn(E, MessageContext) -> BoxFuture<'static, CatgaResult<()>> + Send + Sync>;

pub(crate) struct RequestEntry {
    /// Holds a `PipelineFn<R>` for the entry's request type.
    pipeline: Box<dyn Any + Send + Sync>,
    pub(crate) message_type: &'static str,
}

pub(crate) struct EventEntry {
    /// Holds an `EventInvoker<E>` for the entry's event type.
    invoke: Box<dyn Any + Send + Sync>,
    pub(crate) handler_name: String,
}

/// Frozen dispatch tables. Shared read-only, so lookups take no locks.
#[derive(Default)]
pub struct HandlerRegistry {
    requests: HashMap<TypeId, RequestEntry>,
    events: HashMap<TypeId, Vec<EventEntry>>,
    batchers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub(crate) fn insert_request<R: Request>(&mut self, pipeline: PipelineFn<R>) {
        self.requests.insert(
            TypeId::of::<R>(),
            RequestEntry {
                pipeline: Box::new(pipeline),
                message_type: R::message_type(),
            },
        );
    }

    pub(crate) fn insert_event<E: Event>(&mut self, invoker: EventInvoker<E>, name: String) {
        self.events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(EventEntry {
                invoke: Box::new(invoker),
                handler_name: name,
            });
    }

    pub(crate) fn insert_batcher<R: Request>(
        &mut self,
        scheduler: Arc<crate::batch::BatchScheduler<R>>,
    ) {
        self.batchers.insert(TypeId::of::<R>(), Box::new(scheduler));
    }

    pub(crate) fn request_pipeline<R: Request>(&self) -> Option<PipelineFn<R>> {
        self.requests
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.pipeline.downcast_ref::<PipelineFn<R>>())
            .cloned()
    }

    pub(crate) fn batcher<R: Request>(&self) -> Option<Arc<crate::batch::BatchScheduler<R>>> {
        self.batchers
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<Arc<crate::batch::BatchScheduler<R>>>())
            .cloned()
    }

    /// Handlers for `E` in registration order, with their names.
    pub(crate) fn event_invokers<E: Event>(&self) -> Vec<(String, EventInvoker<E>)> {
        self.events
            .get(&TypeId::of::<E>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        entry
                            .invoke
                            .downcast_ref::<EventInvoker<E>>()
                            .map(|invoker| (entry.handler_name.clone(), invoker.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_request_handler<R: Request>(&self) -> bool {
        self.requests.contains_key(&TypeId::of::<R>()) || self.batchers.contains_key(&TypeId::of::<R>())
    }

    pub fn event_handler_count<E: Event>(&self) -> usize {
        self.events
            .get(&TypeId::of::<E>())
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn request_type_count(&self) -> usize {
        self.requests.len()
    }
}
