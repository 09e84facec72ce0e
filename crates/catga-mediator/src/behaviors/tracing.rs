//! Span-per-request tracing.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use catga_common::telemetry::{MESSAGING_SYSTEM_NAME, OPERATION_RECEIVE};
use catga_common::{CatgaResult, MessageContext, Request};

use crate::pipeline::{Behavior, Next};

/// Opens a `catga.send` span tagged with the message identity; a no-op when
/// no subscriber is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBehavior;

impl TracingBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for TracingBehavior {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response> {
        let span = info_span!(
            "catga.send",
            "messaging.system" = MESSAGING_SYSTEM_NAME,
            "messaging.operation" = OPERATION_RECEIVE,
            "catga.message.id" = ctx.message_id.raw(),
            "catga.message.type" = %ctx.message_type,
            "catga.qos" = %ctx.qos,
            "catga.correlation_id" = ctx.correlation_id.map(|id| id.raw()),
            "catga.success" = tracing::field::Empty,
            "catga.error" = tracing::field::Empty,
            "catga.duration.ms" = tracing::field::Empty,
        );

        let started = Instant::now();
        let result = next.run(request, ctx).instrument(span.clone()).await;

        span.record("catga.success", result.is_ok());
        span.record("catga.duration.ms", started.elapsed().as_millis() as u64);
        if let Err(err) = &result {
            span.record("catga.error", err.code());
        }
        result
    }
}
