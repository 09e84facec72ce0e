//! The public dispatch facade.
//!
//! One instance serves concurrent callers; each call is a single pass
//! through the frozen registry. Cancellation is honored at entry and
//! between the items of batch and stream loops, and a cancelled caller
//! never observes a handler invocation for the item it cancelled before.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use catga_codec::{AnyCodec, Codec};
use catga_common::telemetry::counters;
use catga_common::{
    next_message_id, CatgaError, CatgaResult, ErrorKind, Event, MessageContext, MessageId,
    QosLevel, Request,
};
use catga_resilience::RetryPolicy;
use catga_store::{DeadLetter, DeadLetterStore};

use crate::builder::CatgaBuilder;
use crate::registry::HandlerRegistry;

/// Per-call options for the request path.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Caller-supplied message id; this is the idempotency key. A fresh id
    /// is generated when absent.
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<MessageId>,
    pub qos: Option<QosLevel>,
    pub cancellation: Option<CancellationToken>,
}

impl SendOptions {
    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_correlation_id(mut self, id: MessageId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Per-call options for the event path.
#[derive(Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<MessageId>,
    pub qos: Option<QosLevel>,
    pub cancellation: Option<CancellationToken>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, id: MessageId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) struct MediatorOptions {
    pub(crate) event_parallelism: usize,
    pub(crate) event_retry: Option<RetryPolicy>,
    pub(crate) dead_letters: Option<Arc<dyn DeadLetterStore>>,
    pub(crate) codec: AnyCodec,
    pub(crate) validate_batched: bool,
}

/// Mediator: routes requests to their handler and fans events out to all of
/// theirs. Cheap to clone.
#[derive(Clone)]
pub struct Catga {
    registry: Arc<HandlerRegistry>,
    options: Arc<MediatorOptions>,
}

impl std::fmt::Debug for Catga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catga").finish_non_exhaustive()
    }
}

impl Catga {
    pub(crate) fn new(registry: Arc<HandlerRegistry>, options: MediatorOptions) -> Self {
        Self {
            registry,
            options: Arc::new(options),
        }
    }

    pub fn builder() -> CatgaBuilder {
        CatgaBuilder::new()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub async fn send<R: Request>(&self, request: R) -> CatgaResult<R::Response> {
        self.send_with(request, SendOptions::default()).await
    }

    pub async fn send_with<R: Request>(
        &self,
        request: R,
        options: SendOptions,
    ) -> CatgaResult<R::Response> {
        if is_cancelled(&options.cancellation) {
            return Err(CatgaError::cancelled());
        }
        metrics::counter!(counters::COMMANDS).increment(1);

        let message_id = match options.message_id {
            Some(id) => id,
            None => next_message_id()?,
        };
        let mut ctx = MessageContext::for_message::<R>(message_id);
        ctx.correlation_id = options.correlation_id;
        if let Some(qos) = options.qos {
            ctx.qos = qos;
        }

        if let Some(batcher) = self.registry.batcher::<R>() {
            if self.options.validate_batched {
                request.validate()?;
            }
            return run_cancellable(&options.cancellation, batcher.submit(request, ctx)).await;
        }

        let pipeline = self.registry.request_pipeline::<R>().ok_or_else(|| {
            CatgaError::not_found(
                "handler_missing",
                format!("no handler registered for {}", R::message_type()),
            )
        })?;
        run_cancellable(&options.cancellation, pipeline(request, ctx)).await
    }

    /// Dispatch a batch, one result per input in input order. A failed item
    /// does not abort the rest; cancellation marks every remaining item
    /// `Cancelled` without invoking its handler.
    pub async fn send_batch<R: Request>(
        &self,
        requests: Vec<R>,
        options: SendOptions,
    ) -> Vec<CatgaResult<R::Response>> {
        let mut results = Vec::with_capacity(requests.len());
        let mut cancelled = false;

        for request in requests {
            cancelled = cancelled || is_cancelled(&options.cancellation);
            if cancelled {
                results.push(Err(CatgaError::cancelled()));
                continue;
            }
            let item_options = SendOptions {
                message_id: None,
                correlation_id: options.correlation_id,
                qos: options.qos,
                cancellation: options.cancellation.clone(),
            };
            results.push(self.send_with(request, item_options).await);
        }
        results
    }

    /// Dispatch a stream of requests, yielding one result per input in
    /// order. The stream ends after yielding `Cancelled` once.
    pub fn send_stream<'a, R, S>(
        &'a self,
        requests: S,
        options: SendOptions,
    ) -> impl Stream<Item = CatgaResult<R::Response>> + Send + 'a
    where
        R: Request,
        S: Stream<Item = R> + Send + 'a,
    {
        requests
            .then(move |request| {
                let item_options = SendOptions {
                    message_id: None,
                    correlation_id: options.correlation_id,
                    qos: options.qos,
                    cancellation: options.cancellation.clone(),
                };
                self.send_with(request, item_options)
            })
            .scan(false, |stopped, result| {
                if *stopped {
                    return futures::future::ready(None);
                }
                if matches!(&result, Err(err) if err.kind() == ErrorKind::Cancelled) {
                    *stopped = true;
                }
                futures::future::ready(Some(result))
            })
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub async fn publish<E: Event>(&self, event: E) -> CatgaResult<()> {
        self.publish_with(event, PublishOptions::default()).await
    }

    /// Fan an event out to every registered handler with bounded
    /// parallelism.
    ///
    /// Handler failures are logged, counted and routed to the dead-letter
    /// store once retries are exhausted; they are never surfaced to the
    /// publisher and never cancel peer handlers.
    pub async fn publish_with<E: Event>(
        &self,
        event: E,
        options: PublishOptions,
    ) -> CatgaResult<()> {
        if is_cancelled(&options.cancellation) {
            return Err(CatgaError::cancelled());
        }
        metrics::counter!(counters::EVENTS).increment(1);

        let invokers = self.registry.event_invokers::<E>();
        if invokers.is_empty() {
            // No handlers for an event is a no-op, not an error.
            return Ok(());
        }

        let message_id = next_message_id()?;
        let mut ctx = MessageContext::for_message::<E>(message_id);
        ctx.correlation_id = options.correlation_id;
        if let Some(qos) = options.qos {
            ctx.qos = qos;
        }

        let parallelism = self.options.event_parallelism.max(1);
        let mediator_options = &self.options;
        let event_ref = &event;
        let ctx_ref = &ctx;

        futures::stream::iter(invokers)
            .for_each_concurrent(parallelism, |(handler_name, invoker)| async move {
                let outcome = match &mediator_options.event_retry {
                    Some(policy) => {
                        policy
                            .run(|attempt| {
                                let mut ctx = ctx_ref.clone();
                                ctx.retry_count = attempt - 1;
                                invoker(event_ref.clone(), ctx)
                            })
                            .await
                    }
                    None => invoker(event_ref.clone(), ctx_ref.clone()).await,
                };

                if let Err(err) = outcome {
                    warn!(
                        message_id = %ctx_ref.message_id,
                        event_type = %ctx_ref.message_type,
                        handler = %handler_name,
                        error = %err,
                        "event handler failed"
                    );
                    metrics::counter!(counters::EVENT_HANDLER_FAILURES).increment(1);
                    record_dead_letter(mediator_options, event_ref, ctx_ref, &err).await;
                }
            })
            .await;

        Ok(())
    }

    /// Publish several events; cancellation stops between items.
    pub async fn publish_batch<E: Event>(
        &self,
        events: Vec<E>,
        options: PublishOptions,
    ) -> CatgaResult<()> {
        for event in events {
            if is_cancelled(&options.cancellation) {
                return Err(CatgaError::cancelled());
            }
            self.publish_with(event, options.clone()).await?;
        }
        Ok(())
    }
}

fn is_cancelled(token: &Option<CancellationToken>) -> bool {
    token.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
}

async fn run_cancellable<T>(
    token: &Option<CancellationToken>,
    fut: impl std::future::Future<Output = CatgaResult<T>>,
) -> CatgaResult<T> {
    match token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(CatgaError::cancelled()),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}

async fn record_dead_letter<E: Event>(
    options: &MediatorOptions,
    event: &E,
    ctx: &MessageContext,
    err: &CatgaError,
) {
    let Some(dlq) = &options.dead_letters else {
        return;
    };
    let retry_count = options
        .event_retry
        .as_ref()
        .map(|p| p.max_attempts)
        .unwrap_or(0);

    match options.codec.encode(event) {
        Ok(payload) => {
            let letter = DeadLetter::new(
                ctx.message_id,
                ctx.message_type.clone(),
                payload,
                err.to_string(),
                retry_count,
            );
            if let Err(dlq_err) = dlq.add(letter).await {
                error!(
                    message_id = %ctx.message_id,
                    error = %dlq_err,
                    "failed to record dead letter"
                );
            }
        }
        Err(encode_err) => {
            error!(
                message_id = %ctx.message_id,
                error = %encode_err,
                "failed to encode event for the dead-letter store"
            );
        }
    }
}
