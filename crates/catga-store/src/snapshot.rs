//! Aggregate snapshot persistence. Only the most recent snapshot per
//! aggregate matters.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catga_common::CatgaResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub aggregate_id: String,
    pub version: i64,
    pub state: Bytes,
    pub taken_at: DateTime<Utc>,
}

impl SnapshotEntry {
    pub fn new(aggregate_id: impl Into<String>, version: i64, state: impl Into<Bytes>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version,
            state: state.into(),
            taken_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot. A snapshot older than the stored one is ignored.
    async fn save(&self, entry: SnapshotEntry) -> CatgaResult<()>;

    async fn load(&self, aggregate_id: &str) -> CatgaResult<Option<SnapshotEntry>>;

    async fn delete(&self, aggregate_id: &str) -> CatgaResult<bool>;
}
