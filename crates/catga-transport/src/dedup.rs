//! Message-id deduplication for exactly-once delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use catga_common::{CatgaResult, MessageId};

/// Window-bounded duplicate detection keyed by message id.
///
/// The in-memory implementation covers publisher retries within one process
/// lifetime; backing it with the inbox store extends the window across
/// restarts.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// `true` when the id is first seen inside `window` (deliver it),
    /// `false` for a duplicate (drop it).
    async fn check_and_record(&self, id: MessageId, window: Duration) -> CatgaResult<bool>;
}

const SWEEP_EVERY: u64 = 1024;

/// Process-local dedup set with periodic sweeps of expired entries.
#[derive(Default)]
pub struct InMemoryDeduplicator {
    seen: DashMap<MessageId, Instant>,
    ops: AtomicU64,
}

impl InMemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_sweep(&self) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != 0 {
            return;
        }
        let now = Instant::now();
        self.seen.retain(|_, expires_at| *expires_at > now);
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn check_and_record(&self, id: MessageId, window: Duration) -> CatgaResult<bool> {
        self.maybe_sweep();

        let now = Instant::now();
        let mut fresh = false;
        let mut entry = self.seen.entry(id).or_insert_with(|| {
            fresh = true;
            now + window
        });
        if !fresh && *entry <= now {
            // The previous sighting aged out; record a new one.
            *entry = now + window;
            fresh = true;
        }
        Ok(fresh)
    }
}
