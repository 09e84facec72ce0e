//! Recovery host end-to-end tests against the in-memory stores and the
//! in-process transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use catga_codec::AnyCodec;
use catga_common::{CatgaError, Event, Message, MessageId};
use catga_recovery::{
    stage_event, DlqReplayer, InboxCleaner, InboxCleanerConfig, OutboxPublisher,
    OutboxPublisherConfig, RecoveryHost,
};
use catga_standby::{ElectionConfig, ElectionRunner, LeaderGuard, MemoryLeaderElector};
use catga_store::memory::{MemoryDeadLetterStore, MemoryInboxStore, MemoryOutboxStore};
use catga_store::{DeadLetter, DeadLetterStore, InboxStore, OutboxStatus};
use catga_transport::{InProcessTransport, MessageBus};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shipped {
    order_id: u64,
}

impl Message for Shipped {}
impl Event for Shipped {}

fn bus() -> MessageBus {
    MessageBus::new(Arc::new(InProcessTransport::new()), AnyCodec::json())
}

fn fast_publisher_config() -> OutboxPublisherConfig {
    OutboxPublisherConfig {
        poll_interval: Duration::from_millis(20),
        batch_size: 10,
        claim_lease: Duration::from_millis(50),
        max_attempts: 3,
        published_retention: Duration::from_secs(3600),
        election_name: "catga.outbox-publisher".to_string(),
    }
}

#[tokio::test]
async fn outbox_row_reaches_exactly_one_subscriber() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let dlq = Arc::new(MemoryDeadLetterStore::new());
    let bus = bus();
    let codec = AnyCodec::json();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    bus.subscribe_event(move |event: Shipped, _ctx| {
        let sink = sink.clone();
        async move {
            sink.lock().push(event.order_id);
            Ok(())
        }
    })
    .await
    .unwrap();

    // The handler staged the row inside its transaction.
    let message_id = MessageId::from_raw(7_000);
    stage_event(
        outbox.as_ref(),
        &codec,
        &Shipped { order_id: 7 },
        message_id,
    )
    .await
    .unwrap();

    let publisher = OutboxPublisher::new(
        outbox.clone(),
        bus.clone(),
        dlq.clone(),
        fast_publisher_config(),
    );
    let stats = publisher.tick_once().await;
    assert_eq!(stats.published, 1);

    assert_eq!(*observed.lock(), vec![7]);
    assert_eq!(
        outbox.message(message_id).unwrap().status,
        OutboxStatus::Published
    );

    // A second tick finds nothing to publish.
    let stats = publisher.tick_once().await;
    assert_eq!(stats.claimed, 0);
    assert_eq!(*observed.lock(), vec![7]);
}

#[tokio::test]
async fn failing_rows_retry_then_land_in_the_dlq() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let dlq = Arc::new(MemoryDeadLetterStore::new());
    let bus = bus();
    let codec = AnyCodec::json();

    // Every delivery attempt fails with a transport-style error.
    bus.subscribe_event(|_event: Shipped, _ctx| async move {
        Err::<(), _>(CatgaError::validation("poison", "cannot process"))
    })
    .await
    .unwrap();

    let message_id = MessageId::from_raw(8_000);
    stage_event(
        outbox.as_ref(),
        &codec,
        &Shipped { order_id: 8 },
        message_id,
    )
    .await
    .unwrap();

    let publisher = OutboxPublisher::new(
        outbox.clone(),
        bus.clone(),
        dlq.clone(),
        fast_publisher_config(),
    );

    // Each tick after the claim lease lapses re-attempts the row, until the
    // retry budget is spent and the row moves to the DLQ.
    for _ in 0..4 {
        publisher.tick_once().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let letters = dlq.failed(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, message_id);
    assert_eq!(letters[0].original_type, "Shipped");

    // The exhausted row no longer loops.
    assert_eq!(
        outbox.message(message_id).unwrap().status,
        OutboxStatus::Published
    );
    assert_eq!(publisher.tick_once().await.claimed, 0);
}

#[tokio::test]
async fn follower_does_not_drain_the_outbox() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let dlq = Arc::new(MemoryDeadLetterStore::new());
    let codec = AnyCodec::json();

    stage_event(
        outbox.as_ref(),
        &codec,
        &Shipped { order_id: 1 },
        MessageId::from_raw(9_000),
    )
    .await
    .unwrap();

    // A runner that never ticked is not the leader.
    let elector = Arc::new(MemoryLeaderElector::new());
    let runner = Arc::new(ElectionRunner::new(
        elector,
        ElectionConfig::new("catga.outbox-publisher"),
    ));

    let publisher = OutboxPublisher::new(outbox.clone(), bus(), dlq, fast_publisher_config())
        .with_leader_guard(LeaderGuard::new(runner.clone()));

    let stats = publisher.tick_once().await;
    assert_eq!(stats.claimed, 0);
    assert_eq!(outbox.message(MessageId::from_raw(9_000)).unwrap().status, OutboxStatus::Pending);

    // Once leadership is won, the drain happens.
    runner.tick_once().await;
    let stats = publisher.tick_once().await;
    assert_eq!(stats.claimed, 1);
}

#[tokio::test]
async fn inbox_cleaner_releases_locks_and_prunes_rows() {
    let inbox = Arc::new(MemoryInboxStore::new());

    // A lapsed lock and a fresh one.
    assert!(inbox
        .try_lock(MessageId::from_raw(1), Duration::from_millis(5))
        .await
        .unwrap());
    assert!(inbox
        .try_lock(MessageId::from_raw(2), Duration::from_secs(60))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let cleaner = InboxCleaner::new(
        inbox.clone(),
        InboxCleanerConfig {
            clean_interval: Duration::from_millis(20),
            retention: Duration::from_secs(0),
            ..Default::default()
        },
    );

    let (released, _deleted) = cleaner.tick_once().await;
    assert_eq!(released, 1);

    // The fresh lock survived.
    assert!(!inbox
        .try_lock(MessageId::from_raw(2), Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn dlq_replay_reenqueues_and_removes_entries() {
    let dlq = Arc::new(MemoryDeadLetterStore::new());
    let bus = bus();
    let codec = AnyCodec::json();

    let observed = Arc::new(AtomicU32::new(0));
    let counter = observed.clone();
    bus.subscribe_event(move |event: Shipped, _ctx| {
        let counter = counter.clone();
        async move {
            assert_eq!(event.order_id, 5);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    let payload = {
        use catga_codec::Codec;
        codec.encode(&Shipped { order_id: 5 }).unwrap()
    };
    dlq.add(DeadLetter::new(
        MessageId::from_raw(5_000),
        "Shipped",
        payload,
        "original failure",
        3,
    ))
    .await
    .unwrap();

    let replayer = DlqReplayer::new(dlq.clone(), bus);
    let report = replayer.replay(10).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(dlq.failed(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn recovery_host_runs_workers_until_shutdown() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let inbox = Arc::new(MemoryInboxStore::new());
    let dlq = Arc::new(MemoryDeadLetterStore::new());
    let bus = bus();
    let codec = AnyCodec::json();

    let observed = Arc::new(AtomicU32::new(0));
    let counter = observed.clone();
    bus.subscribe_event(move |_event: Shipped, _ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    let host = RecoveryHost::new(
        OutboxPublisher::new(outbox.clone(), bus.clone(), dlq.clone(), fast_publisher_config()),
        InboxCleaner::new(
            inbox,
            InboxCleanerConfig {
                clean_interval: Duration::from_millis(20),
                ..Default::default()
            },
        ),
        DlqReplayer::new(dlq, bus),
    );
    host.start();

    stage_event(
        outbox.as_ref(),
        &codec,
        &Shipped { order_id: 11 },
        MessageId::from_raw(11_000),
    )
    .await
    .unwrap();

    // The periodic drain picks the row up without a manual tick.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    host.shutdown().await;
}
