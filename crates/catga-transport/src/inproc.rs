//! In-process transport.
//!
//! Subscriptions are registered in a sharded map; each subscription owns a
//! worker task fed by an unbounded channel, so dispatch for one subscriber
//! is FIFO in publish order. The publisher side implements the QoS rules;
//! the worker side runs the retry schedule.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use catga_common::telemetry::counters;
use catga_common::{CatgaError, CatgaResult, DeliveryMode, MessageId, QosLevel};

use crate::dedup::{Deduplicator, InMemoryDeduplicator};
use crate::{SubscribeOptions, SubscriberFn, Subscription, Transport, TransportEnvelope};

#[derive(Debug, Clone)]
pub struct InProcessTransportConfig {
    /// Exactly-once dedup window.
    pub dedup_window: Duration,
    /// Backoff schedule for at-least-once delivery; the list length is the
    /// attempt budget.
    pub retry_delays: Vec<Duration>,
}

impl Default for InProcessTransportConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(300),
            retry_delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ],
        }
    }
}

struct Delivery {
    envelope: TransportEnvelope,
    done: Option<oneshot::Sender<CatgaResult<()>>>,
}

struct SubscriptionEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    active: Arc<AtomicBool>,
}

/// Transport that dispatches inside the current process.
pub struct InProcessTransport {
    config: InProcessTransportConfig,
    subscriptions: Arc<DashMap<String, Vec<SubscriptionEntry>>>,
    dedup: Arc<dyn Deduplicator>,
    next_subscription_id: AtomicU64,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::with_config(InProcessTransportConfig::default())
    }

    pub fn with_config(config: InProcessTransportConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(DashMap::new()),
            dedup: Arc::new(InMemoryDeduplicator::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Swap the dedup set, e.g. for an inbox-backed one that survives
    /// restarts.
    pub fn with_deduplicator(mut self, dedup: Arc<dyn Deduplicator>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscriptions
            .get(subject)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    fn snapshot(&self, subject: &str) -> Vec<(mpsc::UnboundedSender<Delivery>, Arc<AtomicBool>)> {
        self.subscriptions
            .get(subject)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.tx.clone(), e.active.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn dispatch(&self, subject: &str, envelope: TransportEnvelope) -> CatgaResult<()> {
        if envelope.qos == QosLevel::ExactlyOnce {
            if envelope.msg_id <= 0 {
                return Err(CatgaError::validation(
                    "missing_message_id",
                    "exactly-once delivery requires a message id",
                ));
            }
            let fresh = self
                .dedup
                .check_and_record(
                    MessageId::from_raw(envelope.msg_id),
                    self.config.dedup_window,
                )
                .await?;
            if !fresh {
                debug!(
                    message_id = envelope.msg_id,
                    subject = subject,
                    "duplicate message dropped"
                );
                metrics::counter!(counters::TRANSPORT_DEDUP_DROPPED).increment(1);
                return Ok(());
            }
        }

        let entries = self.snapshot(subject);
        if entries.is_empty() {
            return Ok(());
        }

        match envelope.qos {
            QosLevel::AtMostOnce => {
                for (tx, _) in entries {
                    let _ = tx.send(Delivery {
                        envelope: envelope.clone(),
                        done: None,
                    });
                }
                Ok(())
            }
            QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
                if envelope.delivery == DeliveryMode::AsyncRetry {
                    // Retries run in the worker; the publisher is not held up.
                    for (tx, _) in entries {
                        let _ = tx.send(Delivery {
                            envelope: envelope.clone(),
                            done: None,
                        });
                    }
                    return Ok(());
                }

                let mut waiters = Vec::with_capacity(entries.len());
                for (tx, _) in entries {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx
                        .send(Delivery {
                            envelope: envelope.clone(),
                            done: Some(done_tx),
                        })
                        .is_ok()
                    {
                        waiters.push(done_rx);
                    }
                }

                let mut first_error = None;
                for waiter in waiters {
                    // A dropped waiter means the subscriber went away; that
                    // is not a delivery failure.
                    if let Ok(Err(err)) = waiter.await {
                        first_error.get_or_insert(err);
                    }
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn publish(&self, subject: &str, envelope: TransportEnvelope) -> CatgaResult<()> {
        self.dispatch(subject, envelope).await
    }

    async fn send(&self, destination: &str, envelope: TransportEnvelope) -> CatgaResult<()> {
        self.dispatch(destination, envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: SubscriberFn,
        options: SubscribeOptions,
    ) -> CatgaResult<Subscription> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        tokio::spawn(subscription_worker(
            rx,
            handler,
            active.clone(),
            self.config.retry_delays.clone(),
            options.ordered,
        ));

        self.subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(SubscriptionEntry {
                id,
                tx,
                active: active.clone(),
            });

        let subscriptions = self.subscriptions.clone();
        let subject_owned = subject.to_string();
        let cancel = Box::new(move || {
            // Flag first so the worker skips anything still queued, then
            // drop the sender by removing the entry.
            active.store(false, Ordering::Release);
            if let Some(mut entries) = subscriptions.get_mut(&subject_owned) {
                entries.retain(|e| e.id != id);
            }
        });

        Ok(Subscription::new(id, subject, cancel))
    }
}

async fn subscription_worker(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    handler: SubscriberFn,
    active: Arc<AtomicBool>,
    retry_delays: Vec<Duration>,
    ordered: bool,
) {
    while let Some(delivery) = rx.recv().await {
        if !active.load(Ordering::Acquire) {
            // Unsubscribed: queued envelopes were never observed by the
            // subscriber function, so they are dropped, not handled.
            if let Some(done) = delivery.done {
                let _ = done.send(Ok(()));
            }
            continue;
        }

        if ordered {
            handle_delivery(&handler, delivery, &retry_delays).await;
        } else {
            let handler = handler.clone();
            let retry_delays = retry_delays.clone();
            tokio::spawn(async move {
                handle_delivery(&handler, delivery, &retry_delays).await;
            });
        }
    }
}

async fn handle_delivery(handler: &SubscriberFn, delivery: Delivery, retry_delays: &[Duration]) {
    let qos = delivery.envelope.qos;
    let result = match qos {
        QosLevel::AtMostOnce => {
            if let Err(err) = handler(delivery.envelope).await {
                debug!(error = %err, "at-most-once handler failed; dropped");
            }
            Ok(())
        }
        QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
            deliver_with_retries(handler, delivery.envelope, retry_delays).await
        }
    };

    if let Some(done) = delivery.done {
        let _ = done.send(result);
    }
}

async fn deliver_with_retries(
    handler: &SubscriberFn,
    mut envelope: TransportEnvelope,
    retry_delays: &[Duration],
) -> CatgaResult<()> {
    let max_attempts = retry_delays.len().max(1) as u32;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match handler(envelope.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if !err.is_retryable() || attempt >= max_attempts {
                    warn!(
                        message_id = envelope.msg_id,
                        attempts = attempt,
                        error = %err,
                        "delivery failed"
                    );
                    return Err(err);
                }
                let delay = retry_delays
                    .get(attempt as usize - 1)
                    .copied()
                    .unwrap_or_else(|| Duration::from_millis(400));
                debug!(
                    message_id = envelope.msg_id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying delivery"
                );
                tokio::time::sleep(delay).await;
                envelope.retry_count += 1;
            }
        }
    }
}
