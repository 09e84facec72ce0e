//! Manual dead-letter replay.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use catga_common::{CatgaResult, QosLevel};
use catga_store::DeadLetterStore;
use catga_transport::{MessageBus, TransportEnvelope};

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayReport {
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
}

/// Re-enqueues selected dead letters through the transport. Triggered
/// manually, not on a timer.
pub struct DlqReplayer {
    dead_letters: Arc<dyn DeadLetterStore>,
    bus: MessageBus,
}

impl DlqReplayer {
    pub fn new(dead_letters: Arc<dyn DeadLetterStore>, bus: MessageBus) -> Self {
        Self { dead_letters, bus }
    }

    /// Replay up to `limit` dead letters, oldest first. A successfully
    /// replayed entry is removed; a failed replay leaves its row intact.
    pub async fn replay(&self, limit: usize) -> CatgaResult<ReplayReport> {
        let letters = self.dead_letters.failed(limit).await?;
        let mut report = ReplayReport {
            attempted: letters.len(),
            ..Default::default()
        };

        for letter in letters {
            let envelope = TransportEnvelope {
                msg_id: letter.message_id.raw(),
                corr_id: None,
                msg_type: letter.original_type.clone(),
                qos: QosLevel::AtLeastOnce,
                delivery: Default::default(),
                sent_at: Utc::now(),
                retry_count: letter.retry_count,
                payload: letter.payload.clone(),
            };

            match self.bus.publish_raw(&letter.original_type, envelope).await {
                Ok(()) => {
                    self.dead_letters.remove(letter.message_id).await?;
                    report.replayed += 1;
                }
                Err(err) => {
                    warn!(
                        message_id = %letter.message_id,
                        message_type = %letter.original_type,
                        error = %err,
                        "dead-letter replay failed; row kept"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                replayed = report.replayed,
                failed = report.failed,
                "dead-letter replay complete"
            );
        }
        Ok(report)
    }
}
