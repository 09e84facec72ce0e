//! Inbox-backed deduplication for exactly-once delivery across restarts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use catga_common::{CatgaResult, MessageId};
use catga_store::InboxStore;
use catga_transport::Deduplicator;

/// Adapts the durable inbox to the transport's dedup contract.
///
/// A processed inbox row means the message was handled before; otherwise
/// the lock is the first-sighting record: the winner proceeds, everyone
/// else within the window is a duplicate.
pub struct InboxDeduplicator {
    inbox: Arc<dyn InboxStore>,
}

impl InboxDeduplicator {
    pub fn new(inbox: Arc<dyn InboxStore>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl Deduplicator for InboxDeduplicator {
    async fn check_and_record(&self, id: MessageId, window: Duration) -> CatgaResult<bool> {
        if self.inbox.has_been_processed(id).await? {
            return Ok(false);
        }
        self.inbox.try_lock(id, window).await
    }
}
