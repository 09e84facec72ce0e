//! Periodic inbox housekeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use catga_common::CatgaResult;
use catga_standby::LeaderGuard;
use catga_store::InboxStore;

#[derive(Debug, Clone)]
pub struct InboxCleanerConfig {
    /// Cleaning period.
    pub clean_interval: Duration,
    /// Processed rows older than this are deleted.
    pub retention: Duration,
    /// Election gating this worker.
    pub election_name: String,
}

impl Default for InboxCleanerConfig {
    fn default() -> Self {
        Self {
            clean_interval: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            election_name: "catga.inbox-cleaner".to_string(),
        }
    }
}

/// Deletes aged Processed rows and releases lapsed locks.
pub struct InboxCleaner {
    store: Arc<dyn InboxStore>,
    config: InboxCleanerConfig,
    guard: Option<LeaderGuard>,
}

impl InboxCleaner {
    pub fn new(store: Arc<dyn InboxStore>, config: InboxCleanerConfig) -> Self {
        Self {
            store,
            config,
            guard: None,
        }
    }

    pub fn with_leader_guard(mut self, guard: LeaderGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn config(&self) -> &InboxCleanerConfig {
        &self.config
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            clean_interval_s = self.config.clean_interval.as_secs(),
            retention_s = self.config.retention.as_secs(),
            election = %self.config.election_name,
            "starting inbox cleaner"
        );

        let mut ticker = tokio::time::interval(self.config.clean_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("inbox cleaner shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
            }
        }
    }

    /// One cleaning pass, gated on leadership when a guard is set.
    /// Returns `(released_locks, deleted_rows)`.
    pub async fn tick_once(&self) -> (u64, u64) {
        if let Some(guard) = &self.guard {
            if !guard.should_process() {
                debug!("not the leader; skipping inbox cleaning");
                return (0, 0);
            }
        }

        match self.clean().await {
            Ok((released, deleted)) => {
                if released > 0 || deleted > 0 {
                    info!(released, deleted, "inbox cleaning complete");
                }
                (released, deleted)
            }
            Err(err) => {
                error!(error = %err, "inbox cleaning failed");
                (0, 0)
            }
        }
    }

    async fn clean(&self) -> CatgaResult<(u64, u64)> {
        let released = self.store.unlock_expired().await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let deleted = self.store.delete_processed_older_than(cutoff).await?;
        Ok((released, deleted))
    }
}
