//! Message-id keyed response replay.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use catga_common::{CatgaResult, MessageId};

/// Stores which message ids have been handled, optionally with the encoded
/// response so a duplicate request can be answered without re-running the
/// handler.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool>;

    /// Record a processed id. First write wins: repeated marks for the same
    /// id are no-ops, so the operation is commutative and idempotent.
    /// Records lapse after `ttl`; expiry is advisory and reads may observe a
    /// short grace period.
    async fn mark_processed(
        &self,
        id: MessageId,
        response: Option<Bytes>,
        ttl: Duration,
    ) -> CatgaResult<()>;

    /// The stored response for a processed id, if one was recorded.
    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>>;
}
