//! Persistence contracts backing reliable delivery.
//!
//! One trait per store, with two backend families:
//!
//! - [`memory`]: process-local stores used by tests and the in-process
//!   deployment profile
//! - `redis` (feature `redis`): key-value backends following the
//!   `outbox:msg:{id}` / `inbox:msg:{id}` / `events:{stream}` layouts
//!
//! Each operation is atomic within its backend; multi-step sequences rely on
//! conditional writes (locks, leases, expected versions) rather than
//! cross-operation transactions.

pub mod dlq;
pub mod event_store;
pub mod idempotency;
pub mod inbox;
pub mod memory;
pub mod outbox;
pub mod snapshot;

#[cfg(feature = "redis")]
pub mod redis;

pub use dlq::{DeadLetter, DeadLetterStore};
pub use event_store::{
    expected_matches, EventStore, EventStream, NewEvent, StoredEvent, EXPECTED_VERSION_ANY,
};
pub use idempotency::IdempotencyStore;
pub use inbox::{InboxMessage, InboxStatus, InboxStore, DEFAULT_INBOX_RETENTION};
pub use outbox::{OutboxMessage, OutboxStatus, OutboxStore};
pub use snapshot::{SnapshotEntry, SnapshotStore};
