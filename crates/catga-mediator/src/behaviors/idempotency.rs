//! Stored-response replay keyed by message id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use catga_codec::{AnyCodec, Codec};
use catga_common::{CatgaResult, MessageContext, Request};
use catga_store::IdempotencyStore;

use crate::pipeline::{Behavior, Next};

#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    /// How long processed ids are remembered.
    pub ttl: Duration,
    /// Also record failed outcomes, so a permanently failing request is not
    /// re-executed. Off by default: failures stay retryable.
    pub record_failures: bool,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            record_failures: false,
        }
    }
}

/// Answers duplicate requests from the stored response instead of
/// re-invoking the handler.
///
/// This is the only behavior allowed to turn a would-be second execution
/// into a success without calling `next`.
pub struct IdempotencyBehavior {
    store: Arc<dyn IdempotencyStore>,
    codec: AnyCodec,
    options: IdempotencyOptions,
}

impl IdempotencyBehavior {
    pub fn new(store: Arc<dyn IdempotencyStore>, codec: AnyCodec, options: IdempotencyOptions) -> Self {
        Self {
            store,
            codec,
            options,
        }
    }
}

#[async_trait]
impl<R: Request> Behavior<R> for IdempotencyBehavior {
    async fn handle(
        &self,
        request: R,
        ctx: MessageContext,
        next: &Next<R>,
    ) -> CatgaResult<R::Response> {
        let id = ctx.message_id;

        if self.store.has_been_processed(id).await? {
            if let Some(stored) = self.store.processed_result(id).await? {
                debug!(message_id = %id, "duplicate request; replaying stored response");
                return self.codec.decode(&stored);
            }
            // Marked without a stored response: fall through and execute.
        }

        match next.run(request, ctx).await {
            Ok(response) => {
                let encoded = Bytes::from(self.codec.encode(&response)?);
                self.store
                    .mark_processed(id, Some(encoded), self.options.ttl)
                    .await?;
                Ok(response)
            }
            Err(err) => {
                if self.options.record_failures {
                    self.store.mark_processed(id, None, self.options.ttl).await?;
                }
                Err(err)
            }
        }
    }
}
