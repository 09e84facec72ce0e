//! Periodic outbox drain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use catga_codec::{AnyCodec, Codec};
use catga_common::{CatgaResult, Event, MessageId, QosLevel};
use catga_standby::LeaderGuard;
use catga_store::{DeadLetter, DeadLetterStore, OutboxMessage, OutboxStore};
use catga_transport::{MessageBus, TransportEnvelope};

/// Write an event into the outbox alongside the domain state, to be
/// published by the recovery host.
pub async fn stage_event<E: Event>(
    store: &dyn OutboxStore,
    codec: &AnyCodec,
    event: &E,
    message_id: MessageId,
) -> CatgaResult<()> {
    let payload = codec.encode(event)?;
    store
        .add(OutboxMessage::new(message_id, E::message_type(), payload))
        .await
}

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    /// Drain period.
    pub poll_interval: Duration,
    /// Rows claimed per drain.
    pub batch_size: usize,
    /// Claim lease; a crashed publisher's rows become claimable again once
    /// this lapses.
    pub claim_lease: Duration,
    /// Failed publish attempts before a row is routed to the DLQ.
    pub max_attempts: u32,
    /// Published rows older than this are pruned during the drain.
    pub published_retention: Duration,
    /// Election gating this worker.
    pub election_name: String,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            claim_lease: Duration::from_secs(30),
            max_attempts: 5,
            published_retention: Duration::from_secs(60 * 60),
            election_name: "catga.outbox-publisher".to_string(),
        }
    }
}

/// Summary of one drain.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainStats {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub pruned: u64,
}

/// Claims pending rows, publishes them through the transport and applies
/// the failure policy: failed rows stay claimable until their retry budget
/// is spent, then move to the DLQ and stop looping.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: MessageBus,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: OutboxPublisherConfig,
    guard: Option<LeaderGuard>,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: MessageBus,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            store,
            bus,
            dead_letters,
            config,
            guard: None,
        }
    }

    /// Gate drains on leadership for the configured election name.
    pub fn with_leader_guard(mut self, guard: LeaderGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn config(&self) -> &OutboxPublisherConfig {
        &self.config
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            election = %self.config.election_name,
            "starting outbox publisher"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("outbox publisher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
            }
        }
    }

    /// One drain, gated on leadership when a guard is set.
    pub async fn tick_once(&self) -> DrainStats {
        if let Some(guard) = &self.guard {
            if !guard.should_process() {
                debug!("not the leader; skipping outbox drain");
                return DrainStats::default();
            }
        }

        match self.drain().await {
            Ok(stats) => {
                if stats.claimed > 0 {
                    info!(
                        claimed = stats.claimed,
                        published = stats.published,
                        failed = stats.failed,
                        dead_lettered = stats.dead_lettered,
                        "outbox drain complete"
                    );
                }
                stats
            }
            Err(err) => {
                error!(error = %err, "outbox drain failed");
                DrainStats::default()
            }
        }
    }

    async fn drain(&self) -> CatgaResult<DrainStats> {
        let mut stats = DrainStats::default();
        let batch = self
            .store
            .claim_pending(self.config.batch_size, self.config.claim_lease)
            .await?;
        stats.claimed = batch.len();

        for row in batch {
            if row.retry_count >= self.config.max_attempts {
                self.route_to_dlq(&row).await?;
                stats.dead_lettered += 1;
                continue;
            }

            let envelope = TransportEnvelope {
                msg_id: row.message_id.raw(),
                corr_id: None,
                msg_type: row.message_type.clone(),
                qos: QosLevel::AtLeastOnce,
                delivery: Default::default(),
                sent_at: row.created_at,
                retry_count: row.retry_count,
                payload: row.payload.clone(),
            };

            match self.bus.publish_raw(&row.message_type, envelope).await {
                Ok(()) => {
                    self.store.mark_published(row.message_id).await?;
                    stats.published += 1;
                }
                Err(err) => {
                    warn!(
                        message_id = %row.message_id,
                        message_type = %row.message_type,
                        error = %err,
                        "outbox publish failed"
                    );
                    self.store
                        .mark_failed(row.message_id, &err.to_string())
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.published_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        stats.pruned = self.store.delete_published_older_than(cutoff).await?;

        Ok(stats)
    }

    /// A row beyond its retry budget goes to the DLQ and is marked
    /// Published so the drain loop stops re-claiming it.
    async fn route_to_dlq(&self, row: &OutboxMessage) -> CatgaResult<()> {
        warn!(
            message_id = %row.message_id,
            message_type = %row.message_type,
            retry_count = row.retry_count,
            "outbox row exhausted retries; routing to dead letters"
        );
        let letter = DeadLetter::new(
            row.message_id,
            row.message_type.clone(),
            row.payload.clone(),
            row.failure_reason
                .clone()
                .unwrap_or_else(|| "retries exhausted".to_string()),
            row.retry_count,
        );
        self.dead_letters.add(letter).await?;
        self.store.mark_published(row.message_id).await
    }
}
