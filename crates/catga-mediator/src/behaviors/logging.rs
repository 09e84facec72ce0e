//! Structured request logging.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use catga_common::{CatgaResult, MessageContext, Request};

use crate::pipeline::{Behavior, Next};

/// Logs each request with its outcome and elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

impl LoggingBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for LoggingBehavior {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response> {
        debug!(
            message_id = %ctx.message_id,
            message_type = %ctx.message_type,
            "handling request"
        );
        let started = Instant::now();
        let result = next.run(request, ctx.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(
                message_id = %ctx.message_id,
                message_type = %ctx.message_type,
                elapsed_ms = elapsed_ms,
                "request handled"
            ),
            Err(err) => warn!(
                message_id = %ctx.message_id,
                message_type = %ctx.message_type,
                elapsed_ms = elapsed_ms,
                error_kind = %err.kind(),
                error = %err,
                "request failed"
            ),
        }
        result
    }
}
