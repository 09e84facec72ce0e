//! Consumer-side deduplication with message locks.
//!
//! A subscriber takes the lock for a message id before invoking its handler;
//! exactly one locker wins per id. Once handled, the row is promoted to
//! Processed and retained for the dedup window so redeliveries can be
//! answered from the stored result.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use catga_common::{CatgaResult, MessageId};

/// Default retention for Processed rows.
pub const DEFAULT_INBOX_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxStatus {
    Locked,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Bytes,
    pub status: InboxStatus,
    pub lock_expires_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_result: Option<Bytes>,
}

impl InboxMessage {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload: payload.into(),
            status: InboxStatus::Locked,
            lock_expires_at: Utc::now(),
            processed_at: None,
            processing_result: None,
        }
    }

    pub fn with_result(mut self, result: impl Into<Bytes>) -> Self {
        self.processing_result = Some(result.into());
        self
    }
}

/// Durable set of in-flight and processed message ids.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Compare-and-set lock: exactly one caller per id gets `true`; everyone
    /// else gets `false` with no side effects. The lock lapses at `ttl`.
    async fn try_lock(&self, id: MessageId, ttl: Duration) -> CatgaResult<bool>;

    /// Give the lock back without processing (the message becomes lockable
    /// again immediately).
    async fn release_lock(&self, id: MessageId) -> CatgaResult<()>;

    /// Promote a locked message to Processed, storing its result for
    /// `retention`.
    ///
    /// Requires the lock to still be held and unexpired: a caller whose lock
    /// lapsed gets `Conflict`, and a message that is already Processed
    /// returns `Ok(false)`. At most one call per id ever returns `Ok(true)`.
    async fn mark_processed(
        &self,
        message: InboxMessage,
        retention: Duration,
    ) -> CatgaResult<bool>;

    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool>;

    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>>;

    /// Drop Processed rows older than `cutoff`; returns how many were
    /// removed.
    async fn delete_processed_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64>;

    /// Release locks whose ttl has lapsed; returns how many were released.
    async fn unlock_expired(&self) -> CatgaResult<u64>;
}
