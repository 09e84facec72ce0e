//! Terminal sink for messages that exhausted their retry policy.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catga_common::{CatgaResult, MessageId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub original_type: String,
    pub payload: Bytes,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message_id: MessageId,
        original_type: impl Into<String>,
        payload: impl Into<Bytes>,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            message_id,
            original_type: original_type.into(),
            payload: payload.into(),
            error: error.into(),
            retry_count,
            failed_at: Utc::now(),
        }
    }
}

/// Durable storage of failed messages with their last error. Adding never
/// blocks the producing path.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, letter: DeadLetter) -> CatgaResult<()>;

    /// Up to `limit` dead letters, oldest first.
    async fn failed(&self, limit: usize) -> CatgaResult<Vec<DeadLetter>>;

    /// Remove one entry (after a successful replay); returns whether it
    /// existed.
    async fn remove(&self, id: MessageId) -> CatgaResult<bool>;
}
