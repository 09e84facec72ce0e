//! Process-local store backends.
//!
//! Used by tests and the single-process deployment profile. Every operation
//! takes at most one short lock; the maps are sharded (`DashMap`) where
//! contended.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use catga_common::telemetry::counters;
use catga_common::{CatgaError, CatgaResult, MessageId};

use crate::dlq::{DeadLetter, DeadLetterStore};
use crate::event_store::{expected_matches, EventStore, EventStream, NewEvent, StoredEvent};
use crate::idempotency::IdempotencyStore;
use crate::inbox::{InboxMessage, InboxStatus, InboxStore};
use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore};
use crate::snapshot::{SnapshotEntry, SnapshotStore};

// ============================================================================
// Idempotency
// ============================================================================

struct IdempotencyRecord {
    response: Option<Bytes>,
    expires_at: Instant,
}

/// In-memory idempotency store with lazy expiry.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<MessageId, IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool> {
        let live = match self.records.get(&id) {
            Some(record) => record.expires_at > Instant::now(),
            None => return Ok(false),
        };
        if !live {
            self.records.remove(&id);
        }
        Ok(live)
    }

    async fn mark_processed(
        &self,
        id: MessageId,
        response: Option<Bytes>,
        ttl: Duration,
    ) -> CatgaResult<()> {
        // First write wins: repeated marks for the same id are no-ops.
        self.records.entry(id).or_insert_with(|| IdempotencyRecord {
            response,
            expires_at: Instant::now() + ttl,
        });
        Ok(())
    }

    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>> {
        Ok(self
            .records
            .get(&id)
            .filter(|r| r.expires_at > Instant::now())
            .and_then(|r| r.response.clone()))
    }
}

// ============================================================================
// Outbox
// ============================================================================

struct OutboxRow {
    message: OutboxMessage,
    leased_until: Option<Instant>,
}

/// In-memory outbox. Claims are leases: a claimed row is invisible to other
/// publishers until its lease lapses.
#[derive(Default)]
pub struct MemoryOutboxStore {
    rows: Mutex<HashMap<MessageId, OutboxRow>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Current state of one row, if present.
    pub fn message(&self, id: MessageId) -> Option<OutboxMessage> {
        self.rows.lock().get(&id).map(|row| row.message.clone())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn add(&self, message: OutboxMessage) -> CatgaResult<()> {
        metrics::counter!(counters::OUTBOX_ADDED).increment(1);
        self.rows.lock().insert(
            message.message_id,
            OutboxRow {
                message,
                leased_until: None,
            },
        );
        Ok(())
    }

    async fn claim_pending(&self, limit: usize, lease: Duration) -> CatgaResult<Vec<OutboxMessage>> {
        let now = Instant::now();
        let mut rows = self.rows.lock();

        let mut claimable: Vec<(DateTime<Utc>, MessageId)> = rows
            .iter()
            .filter(|(_, row)| {
                !row.message.status.is_terminal()
                    && row.leased_until.map(|until| until <= now).unwrap_or(true)
            })
            .map(|(id, row)| (row.message.created_at, *id))
            .collect();
        claimable.sort();

        let claimed: Vec<MessageId> = claimable.into_iter().take(limit).map(|(_, id)| id).collect();
        let mut batch = Vec::with_capacity(claimed.len());
        for id in claimed {
            let row = rows.get_mut(&id).expect("claimed id is present");
            row.leased_until = Some(now + lease);
            batch.push(row.message.clone());
        }
        Ok(batch)
    }

    async fn mark_published(&self, id: MessageId) -> CatgaResult<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CatgaError::not_found("outbox_row_missing", format!("row {id}")))?;
        row.message.status = OutboxStatus::Published;
        row.message.published_at = Some(Utc::now());
        row.leased_until = None;
        metrics::counter!(counters::OUTBOX_PUBLISHED).increment(1);
        Ok(())
    }

    async fn mark_failed(&self, id: MessageId, reason: &str) -> CatgaResult<()> {
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CatgaError::not_found("outbox_row_missing", format!("row {id}")))?;
        row.message.status = OutboxStatus::Failed;
        row.message.retry_count += 1;
        row.message.failure_reason = Some(reason.to_string());
        row.leased_until = None;
        metrics::counter!(counters::OUTBOX_FAILED).increment(1);
        Ok(())
    }

    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, row| {
            !(row.message.status == OutboxStatus::Published
                && row.message.published_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - rows.len()) as u64)
    }
}

// ============================================================================
// Inbox
// ============================================================================

enum InboxEntry {
    Locked {
        expires_at: Instant,
    },
    Processed {
        message: InboxMessage,
        retain_until: Instant,
    },
}

/// In-memory inbox. The lock is a map entry; expiry is checked on every
/// access so a lapsed lock behaves exactly like a released one.
#[derive(Default)]
pub struct MemoryInboxStore {
    entries: DashMap<MessageId, InboxEntry>,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn try_lock(&self, id: MessageId, ttl: Duration) -> CatgaResult<bool> {
        let now = Instant::now();
        let mut won = false;
        let mut entry = self.entries.entry(id).or_insert_with(|| {
            won = true;
            InboxEntry::Locked {
                expires_at: now + ttl,
            }
        });
        if !won {
            // Entry existed: only an expired lock can be taken over.
            if let InboxEntry::Locked { expires_at } = &mut *entry {
                if *expires_at <= now {
                    *expires_at = now + ttl;
                    won = true;
                }
            }
        }
        if won {
            metrics::counter!(counters::INBOX_LOCKED).increment(1);
        }
        Ok(won)
    }

    async fn release_lock(&self, id: MessageId) -> CatgaResult<()> {
        self.entries
            .remove_if(&id, |_, entry| matches!(entry, InboxEntry::Locked { .. }));
        Ok(())
    }

    async fn mark_processed(
        &self,
        mut message: InboxMessage,
        retention: Duration,
    ) -> CatgaResult<bool> {
        enum Verdict {
            AlreadyProcessed,
            LockExpired,
            Promote,
        }

        let now = Instant::now();
        let id = message.message_id;
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Err(CatgaError::conflict(
                "inbox_lock_not_held",
                format!("no lock held for message {id}"),
            ));
        };

        let verdict = match &*entry {
            InboxEntry::Processed { .. } => Verdict::AlreadyProcessed,
            InboxEntry::Locked { expires_at } if *expires_at <= now => Verdict::LockExpired,
            InboxEntry::Locked { .. } => Verdict::Promote,
        };

        match verdict {
            Verdict::AlreadyProcessed => Ok(false),
            Verdict::LockExpired => Err(CatgaError::conflict(
                "inbox_lock_expired",
                format!("lock for message {id} expired before completion"),
            )),
            Verdict::Promote => {
                message.status = InboxStatus::Processed;
                message.processed_at = Some(Utc::now());
                *entry = InboxEntry::Processed {
                    message,
                    retain_until: now + retention,
                };
                metrics::counter!(counters::INBOX_PROCESSED).increment(1);
                Ok(true)
            }
        }
    }

    async fn has_been_processed(&self, id: MessageId) -> CatgaResult<bool> {
        Ok(self
            .entries
            .get(&id)
            .map(|entry| matches!(&*entry, InboxEntry::Processed { retain_until, .. } if *retain_until > Instant::now()))
            .unwrap_or(false))
    }

    async fn processed_result(&self, id: MessageId) -> CatgaResult<Option<Bytes>> {
        Ok(self.entries.get(&id).and_then(|entry| match &*entry {
            InboxEntry::Processed { message, .. } => message.processing_result.clone(),
            InboxEntry::Locked { .. } => None,
        }))
    }

    async fn delete_processed_older_than(&self, cutoff: DateTime<Utc>) -> CatgaResult<u64> {
        let mut removed = 0u64;
        self.entries.retain(|_, entry| match entry {
            InboxEntry::Processed { message, .. }
                if message.processed_at.map(|at| at < cutoff).unwrap_or(false) =>
            {
                removed += 1;
                false
            }
            _ => true,
        });
        if removed > 0 {
            debug!(removed, "deleted processed inbox rows");
        }
        Ok(removed)
    }

    async fn unlock_expired(&self) -> CatgaResult<u64> {
        let now = Instant::now();
        let mut released = 0u64;
        self.entries.retain(|_, entry| match entry {
            InboxEntry::Locked { expires_at } if *expires_at <= now => {
                released += 1;
                false
            }
            _ => true,
        });
        Ok(released)
    }
}

// ============================================================================
// Event store
// ============================================================================

/// In-memory append-only event log. The per-stream entry guard makes the
/// version check and the append a single atomic step.
#[derive(Default)]
pub struct MemoryEventStore {
    streams: DashMap<String, Vec<StoredEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
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

        let mut stream = self.streams.entry(stream_id.to_string()).or_default();
        let current = stream.len() as i64 - 1;
        if !expected_matches(current, expected_version) {
            return Err(CatgaError::conflict(
                "version_conflict",
                format!(
                    "stream {stream_id}: expected version {expected_version}, current {current}"
                ),
            ));
        }

        for event in events {
            let version = stream.len() as i64;
            stream.push(StoredEvent {
                stream_id: stream_id.to_string(),
                version,
                message_id: event.message_id,
                correlation_id: event.correlation_id,
                event_type: event.event_type,
                payload: event.payload,
                occurred_at: event.occurred_at,
            });
        }
        Ok(stream.len() as i64 - 1)
    }

    async fn read(&self, stream_id: &str, from_version: i64) -> CatgaResult<EventStream> {
        let from = from_version.max(0) as usize;
        let events = self
            .streams
            .get(stream_id)
            .map(|stream| stream.iter().skip(from).cloned().collect())
            .unwrap_or_default();
        Ok(EventStream {
            stream_id: stream_id.to_string(),
            from_version,
            events,
        })
    }

    async fn version(&self, stream_id: &str) -> CatgaResult<i64> {
        Ok(self
            .streams
            .get(stream_id)
            .map(|stream| stream.len() as i64 - 1)
            .unwrap_or(-1))
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// In-memory snapshot store keeping the most recent snapshot per aggregate.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<String, SnapshotEntry>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, entry: SnapshotEntry) -> CatgaResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.snapshots.entry(entry.aggregate_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().version <= entry.version {
                    existing.insert(entry);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        Ok(())
    }

    async fn load(&self, aggregate_id: &str) -> CatgaResult<Option<SnapshotEntry>> {
        Ok(self.snapshots.get(aggregate_id).map(|s| s.clone()))
    }

    async fn delete(&self, aggregate_id: &str) -> CatgaResult<bool> {
        Ok(self.snapshots.remove(aggregate_id).is_some())
    }
}

// ============================================================================
// Dead-letter queue
// ============================================================================

/// In-memory DLQ, oldest first.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn add(&self, letter: DeadLetter) -> CatgaResult<()> {
        metrics::counter!(counters::DLQ_ADDED).increment(1);
        self.letters.lock().push(letter);
        Ok(())
    }

    async fn failed(&self, limit: usize) -> CatgaResult<Vec<DeadLetter>> {
        Ok(self.letters.lock().iter().take(limit).cloned().collect())
    }

    async fn remove(&self, id: MessageId) -> CatgaResult<bool> {
        let mut letters = self.letters.lock();
        let before = letters.len();
        letters.retain(|l| l.message_id != id);
        Ok(letters.len() < before)
    }
}
