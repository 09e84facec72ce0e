//! Scoped mutual exclusion and single-writer selection.
//!
//! The recovery workers gate themselves on leadership so only one instance
//! drains the outbox or cleans the inbox at a time.
//!
//! - [`DistributedLock`]: ttl-scoped mutual exclusion on a named resource
//! - [`LeaderElector`]: single-writer selection per election name
//! - [`ElectionRunner`]: heartbeat loop that maintains leadership and
//!   broadcasts status changes
//!
//! The Redis backends give cross-process guarantees; the in-memory ones are
//! single-process stubs for tests and embedded deployments.

mod error;
mod leader;
mod lock;

pub use error::{Result, StandbyError};
pub use leader::{
    ElectionConfig, ElectionRunner, LeaderElector, LeaderGuard, LeaderInfo, LeadershipStatus,
    MemoryLeaderElector, RedisLeaderElector,
};
pub use lock::{DistributedLock, LockHandle, MemoryLock, RedisLock};
