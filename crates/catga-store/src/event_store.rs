//! Append-only per-stream event log with optimistic concurrency.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catga_common::{CatgaResult, MessageId};

/// Sentinel for an unconditional append.
pub const EXPECTED_VERSION_ANY: i64 = -1;

/// Does `expected` admit an append onto a stream currently at `current`?
///
/// Backends disagree on the version of an empty stream (−1 in one family,
/// 0 in another), so callers go through this predicate and through
/// [`EventStore::is_empty`] instead of comparing raw versions across
/// backends.
pub fn expected_matches(current: i64, expected: i64) -> bool {
    expected == EXPECTED_VERSION_ANY || expected == current
}

/// An event to be appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub message_id: MessageId,
    pub correlation_id: Option<MessageId>,
    pub event_type: String,
    pub payload: Bytes,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        message_id: MessageId,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id,
            correlation_id: None,
            event_type: event_type.into(),
            payload: payload.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// An event as read back, with its position in the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub stream_id: String,
    /// 0-based position within the stream.
    pub version: i64,
    pub message_id: MessageId,
    pub correlation_id: Option<MessageId>,
    pub event_type: String,
    pub payload: Bytes,
    pub occurred_at: DateTime<Utc>,
}

/// A contiguous slice of one stream in append order.
#[derive(Debug, Clone)]
pub struct EventStream {
    pub stream_id: String,
    pub from_version: i64,
    pub events: Vec<StoredEvent>,
}

impl EventStream {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to `stream_id`.
    ///
    /// With `expected_version == EXPECTED_VERSION_ANY` the append is
    /// unconditional. Otherwise the stream's current version must equal
    /// `expected_version`; a mismatch fails with `Conflict` and persists
    /// none of the events. Returns the stream version after the append.
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> CatgaResult<i64>;

    /// Events of `stream_id` starting at `from_version`, contiguous and in
    /// append order.
    async fn read(&self, stream_id: &str, from_version: i64) -> CatgaResult<EventStream>;

    /// Current version = number of events − 1.
    async fn version(&self, stream_id: &str) -> CatgaResult<i64>;

    /// Whether the stream has no events. The portable way to test "new
    /// stream" across backend families.
    async fn is_empty(&self, stream_id: &str) -> CatgaResult<bool> {
        Ok(self.version(stream_id).await? < 0)
    }
}
