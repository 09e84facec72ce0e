//! Transactional-outbox contract.
//!
//! Rows are written next to the domain state and drained by a background
//! publisher. Status only ever advances `Pending -> Published` or
//! `Pending -> Failed`; a Failed row stays claimable so the publisher can
//! retry it until its retry budget is spent.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use catga_common::{CatgaResult, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    /// Published rows are never re-claimed.
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Published)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Bytes,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl OutboxMessage {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload: payload.into(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            published_at: None,
            failure_reason: None,
        }
    }
}

/// Durable queue of messages awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Enqueue a row. Written inside the handler's transaction where the
    /// backend supports it.
    async fn add(&self, message: OutboxMessage) -> CatgaResult<()>;

    /// Claim up to `limit` publishable rows in `created_at` order.
    ///
    /// A claimed row is invisible to other publishers until `lease` lapses,
    /// so concurrent recovery hosts never publish the same row twice while a
    /// claim is live. Failed rows are claimable again once unleased.
    async fn claim_pending(&self, limit: usize, lease: Duration) -> CatgaResult<Vec<OutboxMessage>>;

    async fn mark_published(&self, id: MessageId) -> CatgaResult<()>;

    /// Record a failed publish attempt and bump the retry counter.
    async fn mark_failed(&self, id: MessageId, reason: &str) -> CatgaResult<()>;

    /// Drop Published rows older than `cutoff`; returns how many were
    /// removed.
    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64>;
}
