//! Redis store backends.
//!
//! Key layout:
//!
//! - outbox: `outbox:msg:{id}` (JSON row), `outbox:pending` / `outbox:published`
//!   (sorted sets scored by timestamp)
//! - inbox: `inbox:lock:{id}` (`SET NX PX` with a holder token),
//!   `inbox:msg:{id}` (JSON row with retention TTL), `inbox:processed` zset
//! - event store: `events:{streamId}` list, version = `LLEN - 1`
//! - snapshot: `snapshot:{aggregateId}`
//! - idempotency: `idem:{messageId}` with TTL
//!
//! Multi-step transitions (claim, mark-processed, versioned append) are Lua
//! scripts so each is a single atomic round trip.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use catga_common::telemetry::counters;
use catga_common::{CatgaError, CatgaResult, MessageId};

use crate::dlq::{DeadLetter, DeadLetterStore};
use crate::event_store::{EventStore, EventStream, NewEvent, StoredEvent};
use crate::idempotency::IdempotencyStore;
use crate::inbox::{InboxMessage, InboxStatus, InboxStore};
use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore};
use crate::snapshot::{SnapshotEntry, SnapshotStore};

/// Open a shared connection manager for the store constructors.
pub async fn connect(url: &str) -> CatgaResult<ConnectionManager> {
    let client = redis::Client::open(url).map_err(map_err)?;
    ConnectionManager::new(client).await.map_err(map_err)
}

fn map_err(err: redis::RedisError) -> CatgaError {
    CatgaError::unavailable_from("redis", err)
}

fn to_json<T: Serialize>(value: &T) -> CatgaResult<String> {
    serde_json::to_string(value).map_err(|e| CatgaError::internal_from("row_encode", e))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> CatgaResult<T> {
    serde_json::from_str(raw).map_err(|e| CatgaError::internal_from("row_decode", e))
}

// ============================================================================
// Idempotency
// ============================================================================

pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(id: MessageId) -> String {
        format!("idem:{id}")
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct IdempotencyRow {
    response: Option<Vec<u8>>,
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(exists)
    }

    async fn mark_processed(
        &self,
        id: MessageId,
        response: Option<Bytes>,
        ttl: Duration,
    ) -> CatgaResult<()> {
        let row = to_json(&IdempotencyRow {
            response: response.map(|b| b.to_vec()),
        })?;
        let mut conn = self.conn.clone();
        // NX keeps the first write; duplicate marks are no-ops.
        let _: Option<String> = redis::cmd("SET")
            .arg(Self::key(id))
            .arg(row)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        match raw {
            Some(raw) => {
                let row: IdempotencyRow = from_json(&raw)?;
                Ok(row.response.map(Bytes::from))
            }
            None => Ok(None),
        }
    }
}

// ============================================================================
// Outbox
// ============================================================================

const OUTBOX_PENDING: &str = "outbox:pending";
const OUTBOX_PUBLISHED: &str = "outbox:published";

/// Claim pending ids and push their visibility into the future in one step,
/// so no two publishers see the same row while a lease is live.
const CLAIM_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
    for i, id in ipairs(ids) do
        redis.call('ZADD', KEYS[1], 'XX', ARGV[2], id)
    end
    return ids
"#;

pub struct RedisOutboxStore {
    conn: ConnectionManager,
}

impl RedisOutboxStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn msg_key(id: MessageId) -> String {
        format!("outbox:msg:{id}")
    }

    async fn load_row(&self, id: MessageId) -> CatgaResult<OutboxMessage> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::msg_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        raw.ok_or_else(|| CatgaError::not_found("outbox_row_missing", format!("row {id}")))
            .and_then(|r| from_json(&r))
    }

    async fn store_row(&self, row: &OutboxMessage) -> CatgaResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::msg_key(row.message_id))
            .arg(to_json(row)?)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for RedisOutboxStore {
    async fn add(&self, message: OutboxMessage) -> CatgaResult<()> {
        self.store_row(&message).await?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(OUTBOX_PENDING)
            .arg(message.created_at.timestamp_millis())
            .arg(message.message_id.raw())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        metrics::counter!(counters::OUTBOX_ADDED).increment(1);
        Ok(())
    }

    async fn claim_pending(&self, limit: usize, lease: Duration) -> CatgaResult<Vec<OutboxMessage>> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now + lease.as_millis() as i64;

        let mut conn = self.conn.clone();
        let ids: Vec<i64> = redis::Script::new(CLAIM_SCRIPT)
            .key(OUTBOX_PENDING)
            .arg(now)
            .arg(lease_until)
            .arg(limit as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        let mut batch = Vec::with_capacity(ids.len());
        for raw in ids {
            match self.load_row(MessageId::from_raw(raw)).await {
                Ok(row) => batch.push(row),
                // A row pruned between claim and load is skipped.
                Err(err) if err.kind() == catga_common::ErrorKind::NotFound => {
                    debug!(message_id = raw, "claimed outbox row disappeared");
                }
                Err(err) => return Err(err),
            }
        }
        batch.sort_by_key(|m| (m.created_at, m.message_id));
        Ok(batch)
    }

    async fn mark_published(&self, id: MessageId) -> CatgaResult<()> {
        let mut row = self.load_row(id).await?;
        row.status = OutboxStatus::Published;
        row.published_at = Some(Utc::now());
        self.store_row(&row).await?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZREM")
            .arg(OUTBOX_PENDING)
            .arg(id.raw())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let _: () = redis::cmd("ZADD")
            .arg(OUTBOX_PUBLISHED)
            .arg(Utc::now().timestamp_millis())
            .arg(id.raw())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        metrics::counter!(counters::OUTBOX_PUBLISHED).increment(1);
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, reason: &str) -> CatgaResult<()> {
        let mut row = self.load_row(id).await?;
        row.status = OutboxStatus::Failed;
        row.retry_count += 1;
        row.failure_reason = Some(reason.to_string());
        self.store_row(&row).await?;
        // The pending score stays at the claim lease, so the row becomes
        // claimable again when the lease lapses.
        metrics::counter!(counters::OUTBOX_FAILED).increment(1);
        Ok(())
    }

    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = redis::cmd("ZRANGEBYSCORE")
            .arg(OUTBOX_PUBLISHED)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        for raw in &ids {
            let _: () = redis::cmd("DEL")
                .arg(Self::msg_key(MessageId::from_raw(*raw)))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
        }
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(OUTBOX_PUBLISHED)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ids.len() as u64)
    }
}

// ============================================================================
// Inbox
// ============================================================================

const INBOX_PROCESSED: &str = "inbox:processed";

/// Atomic del-if-holder.
const RELEASE_LOCK_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

/// Promote a locked message to Processed: only the current lock holder may,
/// an already-processed row short-circuits, and the lock is consumed.
const MARK_PROCESSED_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[2]) == 1 then return 0 end
    if redis.call('GET', KEYS[1]) ~= ARGV[1] then return -1 end
    redis.call('SET', KEYS[2], ARGV[2], 'PX', tonumber(ARGV[3]))
    redis.call('ZADD', KEYS[3], ARGV[4], ARGV[5])
    redis.call('DEL', KEYS[1])
    return 1
"#;

pub struct RedisInboxStore {
    conn: ConnectionManager,
    /// Lock-holder token for this store instance.
    holder_id: String,
}

impl RedisInboxStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            holder_id: Uuid::new_v4().to_string(),
        }
    }

    fn lock_key(id: MessageId) -> String {
        format!("inbox:lock:{id}")
    }

    fn msg_key(id: MessageId) -> String {
        format!("inbox:msg:{id}")
    }
}

#[async_trait]
impl InboxStore for RedisInboxStore {
    async fn try_lock(&self, id: MessageId, ttl: Duration) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        // Do not lock ids that already carry a processed row.
        let processed: bool = redis::cmd("EXISTS")
            .arg(Self::msg_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if processed {
            return Ok(false);
        }
        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(id))
            .arg(&self.holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if acquired.is_some() {
            metrics::counter!(counters::INBOX_LOCKED).increment(1);
        }
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, id: MessageId) -> CatgaResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(Self::lock_key(id))
            .arg(&self.holder_id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_processed(
        &self,
        mut message: InboxMessage,
        retention: Duration,
    ) -> CatgaResult<bool> {
        let id = message.message_id;
        message.status = InboxStatus::Processed;
        message.processed_at = Some(Utc::now());
        let row = to_json(&message)?;

        let mut conn = self.conn.clone();
        let outcome: i32 = redis::Script::new(MARK_PROCESSED_SCRIPT)
            .key(Self::lock_key(id))
            .key(Self::msg_key(id))
            .key(INBOX_PROCESSED)
            .arg(&self.holder_id)
            .arg(row)
            .arg(retention.as_millis() as u64)
            .arg(Utc::now().timestamp_millis())
            .arg(id.raw())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        match outcome {
            1 => {
                metrics::counter!(counters::INBOX_PROCESSED).increment(1);
                Ok(true)
            }
            0 => Ok(false),
            _ => Err(CatgaError::conflict(
                "inbox_lock_not_held",
                format!("lock for message {id} is expired or held elsewhere"),
            )),
        }
    }

    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::msg_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(exists)
    }

    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::msg_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        match raw {
            Some(raw) => {
                let row: InboxMessage = from_json(&raw)?;
                Ok(row.processing_result)
            }
            None => Ok(None),
        }
    }

    async fn delete_processed_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = redis::cmd("ZRANGEBYSCORE")
            .arg(INBOX_PROCESSED)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        for raw in &ids {
            let _: () = redis::cmd("DEL")
                .arg(Self::msg_key(MessageId::from_raw(*raw)))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
        }
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(INBOX_PROCESSED)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ids.len() as u64)
    }

    async fn unlock_expired(&self) -> CatgaResult<u64> {
        // Locks carry a PX expiry and lapse on their own.
        Ok(0)
    }
}

// ============================================================================
// Event store
// ============================================================================

/// Version check and append as one atomic step. Returns the new version, or
/// -2 on an expected-version mismatch.
const APPEND_SCRIPT: &str = r#"
    local len = redis.call('LLEN', KEYS[1])
    local expected = tonumber(ARGV[1])
    if expected >= 0 and expected ~= len - 1 then return -2 end
    for i = 2, #ARGV do
        redis.call('RPUSH', KEYS[1], ARGV[i])
    end
    return redis.call('LLEN', KEYS[1]) - 1
"#;

pub struct RedisEventStore {
    conn: ConnectionManager,
}

impl RedisEventStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn stream_key(stream_id: &str) -> String {
        format!("events:{stream_id}")
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> CatgaResult<i64> {
        if events.is_empty() {
            return Err(CatgaError::validation(
                "empty_batch",
                "append requires at least one event",
            ));
        }

        let script = redis::Script::new(APPEND_SCRIPT);
        let mut invocation = script.key(Self::stream_key(stream_id));
        invocation.arg(expected_version);
        for event in &events {
            invocation.arg(to_json(event)?);
        }

        let mut conn = self.conn.clone();
        let outcome: i64 = invocation.invoke_async(&mut conn).await.map_err(map_err)?;
        if outcome == -2 {
            return Err(CatgaError::conflict(
                "version_conflict",
                format!("stream {stream_id}: expected version {expected_version}"),
            ));
        }
        Ok(outcome)
    }

    async fn read(&self, stream_id: &str, from_version: i64) -> CatgaResult<EventStream> {
        let from = from_version.max(0);
        let mut conn = self.conn.clone();
        let rows: Vec<String> = redis::cmd("LRANGE")
            .arg(Self::stream_key(stream_id))
            .arg(from)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for (offset, raw) in rows.iter().enumerate() {
            let event: NewEvent = from_json(raw)?;
            events.push(StoredEvent {
                stream_id: stream_id.to_string(),
                version: from + offset as i64,
                message_id: event.message_id,
                correlation_id: event.correlation_id,
                event_type: event.event_type,
                payload: event.payload,
                occurred_at: event.occurred_at,
            });
        }
        Ok(EventStream {
            stream_id: stream_id.to_string(),
            from_version,
            events,
        })
    }

    async fn version(&self, stream_id: &str) -> CatgaResult<i64> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("LLEN")
            .arg(Self::stream_key(stream_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(len - 1)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Keep the newest snapshot per aggregate.
const SNAPSHOT_SAVE_SCRIPT: &str = r#"
    local existing = redis.call('GET', KEYS[1])
    if existing then
        local current = cjson.decode(existing)
        if tonumber(current['version']) > tonumber(ARGV[2]) then return 0 end
    end
    redis.call('SET', KEYS[1], ARGV[1])
    return 1
"#;

pub struct RedisSnapshotStore {
    conn: ConnectionManager,
}

impl RedisSnapshotStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(aggregate_id: &str) -> String {
        format!("snapshot:{aggregate_id}")
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, entry: SnapshotEntry) -> CatgaResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(SNAPSHOT_SAVE_SCRIPT)
            .key(Self::key(&entry.aggregate_id))
            .arg(to_json(&entry)?)
            .arg(entry.version)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> CatgaResult<Option<SnapshotEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(aggregate_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        raw.map(|r| from_json(&r)).transpose()
    }

    async fn delete(&self, aggregate_id: &str) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(Self::key(aggregate_id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }
}

// ============================================================================
// Dead-letter queue
// ============================================================================

const DLQ_QUEUE: &str = "dlq:queue";

pub struct RedisDeadLetterStore {
    conn: ConnectionManager,
}

impl RedisDeadLetterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn msg_key(id: MessageId) -> String {
        format!("dlq:msg:{id}")
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn add(&self, letter: DeadLetter) -> CatgaResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::msg_key(letter.message_id))
            .arg(to_json(&letter)?)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let _: () = redis::cmd("RPUSH")
            .arg(DLQ_QUEUE)
            .arg(letter.message_id.raw())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        metrics::counter!(counters::DLQ_ADDED).increment(1);
        Ok(())
    }

    async fn failed(&self, limit: usize) -> CatgaResult<Vec<DeadLetter>> {
        let mut conn = self.conn.clone();
        let ids: Vec<i64> = redis::cmd("LRANGE")
            .arg(DLQ_QUEUE)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let mut letters = Vec::with_capacity(ids.len());
        for raw in ids {
            let row: Option<String> = redis::cmd("GET")
                .arg(Self::msg_key(MessageId::from_raw(raw)))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            if let Some(row) = row {
                letters.push(from_json(&row)?);
            }
        }
        Ok(letters)
    }

    async fn remove(&self, id: MessageId) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(DLQ_QUEUE)
            .arg(0)
            .arg(id.raw())
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let _: () = redis::cmd("DEL")
            .arg(Self::msg_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }
}
