//! QoS semantics of the in-process transport.
//!
//! Covers fire-and-forget, awaited at-least-once delivery with retries,
//! exactly-once duplicate dropping, per-subscriber ordering and unsubscribe.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use catga_codec::AnyCodec;
use catga_common::{
    CatgaError, CatgaResult, Event, Message, MessageContext, MessageId, QosLevel,
};
use catga_transport::{InProcessTransport, MessageBus};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
}

impl Message for OrderCreated {}
impl Event for OrderCreated {}

fn bus() -> MessageBus {
    MessageBus::new(Arc::new(InProcessTransport::new()), AnyCodec::json())
}

fn ctx(raw_id: i64, qos: QosLevel) -> MessageContext {
    MessageContext::for_message::<OrderCreated>(MessageId::from_raw(raw_id)).with_qos(qos)
}

#[tokio::test]
async fn at_least_once_waits_for_subscriber_completion() {
    let bus = bus();
    let seen = Arc::new(AtomicU32::new(0));

    let counter = seen.clone();
    bus.subscribe_event(move |event: OrderCreated, _ctx| {
        let counter = counter.clone();
        async move {
            assert_eq!(event.id, 42);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish_event(&OrderCreated { id: 42 }, &ctx(1, QosLevel::AtLeastOnce))
        .await
        .unwrap();

    // The publish awaited the handler, so the count is already visible.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_least_once_retries_transient_failures() {
    let bus = bus();
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    bus.subscribe_event(move |_event: OrderCreated, _ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CatgaError::unavailable("flaky", "first attempt fails"))
            } else {
                Ok(())
            }
        }
    })
    .await
    .unwrap();

    bus.publish_event(&OrderCreated { id: 1 }, &ctx(2, QosLevel::AtLeastOnce))
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn at_least_once_surfaces_exhausted_retries() {
    let bus = bus();
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    bus.subscribe_event(move |_event: OrderCreated, _ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CatgaError::unavailable("down", "always fails"))
        }
    })
    .await
    .unwrap();

    let err = bus
        .publish_event(&OrderCreated { id: 1 }, &ctx(3, QosLevel::AtLeastOnce))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), catga_common::ErrorKind::Unavailable);
    // Attempt budget is the length of the retry schedule.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn at_most_once_swallows_handler_errors() {
    let bus = bus();
    let seen = Arc::new(AtomicU32::new(0));

    let counter = seen.clone();
    bus.subscribe_event(move |_event: OrderCreated, _ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CatgaError::internal("boom", "handler exploded"))
        }
    })
    .await
    .unwrap();

    bus.publish_event(&OrderCreated { id: 9 }, &ctx(4, QosLevel::AtMostOnce))
        .await
        .unwrap();

    // Fire-and-forget: give the detached delivery a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exactly_once_drops_duplicate_message_ids() {
    let bus = bus();
    let seen = Arc::new(AtomicU32::new(0));

    let counter = seen.clone();
    bus.subscribe_event(move |_event: OrderCreated, _ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    // Two publishes with the identical message id inside the window.
    let event = OrderCreated { id: 7 };
    bus.publish_event(&event, &ctx(4242, QosLevel::ExactlyOnce))
        .await
        .unwrap();
    bus.publish_event(&event, &ctx(4242, QosLevel::ExactlyOnce))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exactly_once_requires_a_message_id() {
    let bus = bus();
    let err = bus
        .publish_event(&OrderCreated { id: 1 }, &ctx(0, QosLevel::ExactlyOnce))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), catga_common::ErrorKind::Validation);
}

#[tokio::test]
async fn ordered_subscriber_sees_publish_order() {
    let bus = bus();
    let order = Arc::new(parking_lot_order::OrderLog::default());

    let log = order.clone();
    bus.subscribe_event(move |event: OrderCreated, _ctx| {
        let log = log.clone();
        async move {
            // Stagger early messages so out-of-order dispatch would show up.
            if event.id == 0 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            log.push(event.id);
            Ok(())
        }
    })
    .await
    .unwrap();

    for i in 0..5u64 {
        bus.publish_event(
            &OrderCreated { id: i },
            &ctx(100 + i as i64, QosLevel::AtLeastOnce),
        )
        .await
        .unwrap();
    }

    assert_eq!(order.snapshot(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn unsubscribed_handlers_receive_nothing_new() {
    let bus = bus();
    let seen = Arc::new(AtomicU32::new(0));

    let counter = seen.clone();
    let subscription = bus
        .subscribe_event(move |_event: OrderCreated, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    bus.publish_event(&OrderCreated { id: 1 }, &ctx(10, QosLevel::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    subscription.unsubscribe();
    bus.publish_event(&OrderCreated { id: 2 }, &ctx(11, QosLevel::AtLeastOnce))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fanout_reaches_every_subscriber() {
    let bus = bus();
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    for counter in [first.clone(), second.clone()] {
        bus.subscribe_event(move |_event: OrderCreated, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    }

    bus.publish_event(&OrderCreated { id: 3 }, &ctx(20, QosLevel::AtLeastOnce))
        .await
        .unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

/// Small ordered log used by the ordering test.
mod parking_lot_order {
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct OrderLog {
        entries: Mutex<Vec<u64>>,
    }

    impl OrderLog {
        pub fn push(&self, value: u64) {
            self.entries.lock().push(value);
        }

        pub fn snapshot(&self) -> Vec<u64> {
            self.entries.lock().clone()
        }
    }
}
