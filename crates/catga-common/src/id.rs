//! Time-ordered message id generation.
//!
//! A [`MessageId`] packs 41 bits of milliseconds since the Unix epoch,
//! 10 bits of worker id and a 12-bit per-millisecond sequence into a
//! strictly positive `i64`. Ids are strictly increasing per generator and
//! unique across workers with distinct worker ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CatgaError, CatgaResult};

const TIMESTAMP_BITS: u32 = 41;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;

const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// 64-bit time-ordered message identifier. Also used as a correlation id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// Milliseconds since the Unix epoch at generation time.
    pub fn timestamp_ms(self) -> u64 {
        (self.0 as u64) >> TIMESTAMP_SHIFT
    }

    pub fn worker_id(self) -> u16 {
        (((self.0 as u64) >> WORKER_SHIFT) & MAX_WORKER as u64) as u16
    }

    pub fn sequence(self) -> u16 {
        ((self.0 as u64) & MAX_SEQUENCE) as u16
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<MessageId> for i64 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl From<i64> for MessageId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// What to do when the system clock runs backwards past the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPolicy {
    /// Fail the call with a `clock_regression` error (default).
    Refuse,
    /// Busy-wait until the clock catches up with the last issued timestamp.
    WaitOut,
}

/// Generator for [`MessageId`]s with a fixed worker id.
///
/// The last issued `(timestamp, sequence)` pair lives in one atomic word, so
/// concurrent callers coordinate with a CAS loop instead of a lock.
pub struct IdGenerator {
    worker_id: u16,
    tolerance: Duration,
    policy: ClockPolicy,
    /// `(last_ms << 12) | last_sequence`
    state: AtomicU64,
}

impl IdGenerator {
    pub fn new(worker_id: u16) -> CatgaResult<Self> {
        if worker_id > MAX_WORKER {
            return Err(CatgaError::validation(
                "worker_id_out_of_range",
                format!("worker id {worker_id} exceeds {MAX_WORKER}"),
            ));
        }
        Ok(Self {
            worker_id,
            tolerance: Duration::ZERO,
            policy: ClockPolicy::Refuse,
            state: AtomicU64::new(0),
        })
    }

    /// Accept clock regressions up to `tolerance` by reusing the last
    /// observed timestamp.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_clock_policy(mut self, policy: ClockPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Issue the next id. Strictly increasing for a fixed generator.
    pub fn next_id(&self) -> CatgaResult<MessageId> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let last_ms = state >> SEQUENCE_BITS;
            let last_seq = state & MAX_SEQUENCE;

            let now = self.observe_clock(last_ms)?;

            let (ms, seq) = if now > last_ms {
                (now, 0)
            } else if last_seq < MAX_SEQUENCE {
                (last_ms, last_seq + 1)
            } else {
                // Sequence exhausted for this millisecond; wait for the next.
                std::hint::spin_loop();
                continue;
            };

            let next_state = (ms << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(state, next_state, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let raw = ((ms & MAX_TIMESTAMP) << TIMESTAMP_SHIFT)
                    | ((self.worker_id as u64) << WORKER_SHIFT)
                    | seq;
                return Ok(MessageId(raw as i64));
            }
        }
    }

    /// Read the wall clock and apply the regression policy against the last
    /// issued timestamp.
    fn observe_clock(&self, last_ms: u64) -> CatgaResult<u64> {
        let now = wall_clock_ms();
        if now >= last_ms {
            return Ok(now);
        }
        let behind = Duration::from_millis(last_ms - now);
        if behind <= self.tolerance {
            // Inside tolerance: keep issuing against the last timestamp.
            return Ok(last_ms);
        }
        match self.policy {
            ClockPolicy::Refuse => Err(CatgaError::internal(
                "clock_regression",
                format!("system clock moved {}ms backwards", behind.as_millis()),
            )),
            ClockPolicy::WaitOut => {
                std::thread::sleep(behind);
                Ok(wall_clock_ms().max(last_ms))
            }
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

static PROCESS_GENERATOR: OnceLock<IdGenerator> = OnceLock::new();

/// Issue an id from the process-wide generator.
///
/// The worker id comes from `CATGA_WORKER_ID` when set, otherwise it is
/// drawn at random once per process.
pub fn next_message_id() -> CatgaResult<MessageId> {
    let generator = PROCESS_GENERATOR.get_or_init(|| {
        let worker = std::env::var("CATGA_WORKER_ID")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|w| *w <= MAX_WORKER)
            .unwrap_or_else(|| {
                use rand::Rng;
                rand::rng().random_range(0..=MAX_WORKER)
            });
        IdGenerator::new(worker).expect("worker id is masked into range")
    });
    generator.next_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = IdGenerator::new(7).unwrap();
        let mut previous = generator.next_id().unwrap();
        for _ in 0..10_000 {
            let id = generator.next_id().unwrap();
            assert!(id > previous, "{id} must exceed {previous}");
            previous = id;
        }
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let generator = std::sync::Arc::new(IdGenerator::new(3).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(std::thread::spawn(move || {
                (0..2_000)
                    .map(|_| generator.next_id().unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
    }

    #[test]
    fn layout_round_trips() {
        let generator = IdGenerator::new(42).unwrap();
        let id = generator.next_id().unwrap();
        assert!(id.raw() > 0);
        assert_eq!(id.worker_id(), 42);
        let now = wall_clock_ms();
        assert!(id.timestamp_ms() <= now && id.timestamp_ms() >= now - 1_000);
    }

    #[test]
    fn rejects_out_of_range_worker() {
        assert!(IdGenerator::new(1024).is_err());
        assert!(IdGenerator::new(1023).is_ok());
    }

    #[test]
    fn process_generator_issues_ids() {
        let a = next_message_id().unwrap();
        let b = next_message_id().unwrap();
        assert!(b > a);
    }
}
