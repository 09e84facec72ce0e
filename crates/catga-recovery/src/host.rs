//! Worker lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dlq_replayer::DlqReplayer;
use crate::inbox_cleaner::InboxCleaner;
use crate::outbox_publisher::OutboxPublisher;

/// Owns the periodic workers and their shutdown token.
///
/// The DLQ replayer is held for manual triggering; it has no timer.
pub struct RecoveryHost {
    outbox_publisher: Arc<OutboxPublisher>,
    inbox_cleaner: Arc<InboxCleaner>,
    dlq_replayer: Arc<DlqReplayer>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecoveryHost {
    pub fn new(
        outbox_publisher: OutboxPublisher,
        inbox_cleaner: InboxCleaner,
        dlq_replayer: DlqReplayer,
    ) -> Self {
        Self {
            outbox_publisher: Arc::new(outbox_publisher),
            inbox_cleaner: Arc::new(inbox_cleaner),
            dlq_replayer: Arc::new(dlq_replayer),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn outbox_publisher(&self) -> &Arc<OutboxPublisher> {
        &self.outbox_publisher
    }

    pub fn inbox_cleaner(&self) -> &Arc<InboxCleaner> {
        &self.inbox_cleaner
    }

    pub fn dlq_replayer(&self) -> &Arc<DlqReplayer> {
        &self.dlq_replayer
    }

    /// Spawn the periodic workers.
    pub fn start(&self) {
        info!("starting recovery host");
        let mut tasks = self.tasks.lock();

        let publisher = self.outbox_publisher.clone();
        let token = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            publisher.run(token).await;
        }));

        let cleaner = self.inbox_cleaner.clone();
        let token = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            cleaner.run(token).await;
        }));
    }

    /// Stop the workers and wait for their current iteration to finish.
    pub async fn shutdown(&self) {
        info!("stopping recovery host");
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
