//! Auto-batching scheduler tests.
//!
//! Covers size- and timeout-triggered flushes, shard keying and FIFO order,
//! overflow fail-fast, eviction draining, flush error fan-out and abandoned
//! waiters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use catga_common::{CatgaError, CatgaResult, ErrorKind, Message, MessageContext, Request};
use catga_mediator::{BatchHandler, BatchOptions, Catga, SendOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lookup {
    tenant: String,
    key: u64,
}

impl Message for Lookup {}
impl Request for Lookup {
    type Response = u64;
}

/// Records each flushed batch and answers `key * 2`.
struct DoublingHandler {
    batches: Arc<Mutex<Vec<Vec<u64>>>>,
    flushes: Arc<AtomicU32>,
}

impl DoublingHandler {
    fn new() -> (Self, Arc<Mutex<Vec<Vec<u64>>>>, Arc<AtomicU32>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let flushes = Arc::new(AtomicU32::new(0));
        (
            Self {
                batches: batches.clone(),
                flushes: flushes.clone(),
            },
            batches,
            flushes,
        )
    }
}

#[async_trait]
impl BatchHandler<Lookup> for DoublingHandler {
    async fn handle_batch(
        &self,
        requests: Vec<Lookup>,
        _ctx: &MessageContext,
    ) -> CatgaResult<Vec<CatgaResult<u64>>> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .push(requests.iter().map(|r| r.key).collect());
        Ok(requests.into_iter().map(|r| Ok(r.key * 2)).collect())
    }
}

fn lookup(key: u64) -> Lookup {
    Lookup {
        tenant: "acme".to_string(),
        key,
    }
}

#[tokio::test]
async fn size_trigger_flushes_a_full_batch() {
    let (handler, batches, flushes) = DoublingHandler::new();
    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            handler,
            BatchOptions::default()
                .with_max_batch_size(4)
                .with_batch_timeout(Duration::from_secs(30)),
        )
        .build()
        .unwrap();

    let mut waiters = Vec::new();
    for key in 0..4u64 {
        let mediator = mediator.clone();
        waiters.push(tokio::spawn(async move {
            mediator.send(lookup(key)).await
        }));
    }
    for (key, waiter) in waiters.into_iter().enumerate() {
        assert_eq!(waiter.await.unwrap().unwrap(), key as u64 * 2);
    }

    // One flush carried all four items, in FIFO order.
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    let recorded = batches.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].len(), 4);
}

#[tokio::test]
async fn timeout_trigger_flushes_a_partial_batch() {
    let (handler, _batches, flushes) = DoublingHandler::new();
    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            handler,
            BatchOptions::default()
                .with_max_batch_size(100)
                .with_batch_timeout(Duration::from_millis(50)),
        )
        .build()
        .unwrap();

    let result = mediator.send(lookup(21)).await.unwrap();
    assert_eq!(result, 42);
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fifo_within_a_shard() {
    let (handler, batches, _flushes) = DoublingHandler::new();
    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            handler,
            BatchOptions::default()
                .with_max_batch_size(8)
                .with_batch_timeout(Duration::from_millis(50)),
        )
        .build()
        .unwrap();

    let mut waiters = Vec::new();
    for key in 0..8u64 {
        // Submit sequentially so the enqueue order is defined.
        let mediator = mediator.clone();
        let handle = tokio::spawn(async move { mediator.send(lookup(key)).await });
        tokio::task::yield_now().await;
        waiters.push(handle);
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    let recorded = batches.lock();
    let flat: Vec<u64> = recorded.iter().flatten().copied().collect();
    assert_eq!(flat, (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn key_extractor_partitions_into_shards() {
    let (handler, batches, _flushes) = DoublingHandler::new();
    let mediator = Catga::builder()
        .register_batch_handler_with_key::<Lookup, _, _>(
            handler,
            BatchOptions::default()
                .with_max_batch_size(2)
                .with_batch_timeout(Duration::from_secs(30)),
            |request| request.tenant.clone(),
        )
        .build()
        .unwrap();

    let mut waiters = Vec::new();
    for (tenant, key) in [("a", 1u64), ("b", 10), ("a", 2), ("b", 20)] {
        let mediator = mediator.clone();
        let request = Lookup {
            tenant: tenant.to_string(),
            key,
        };
        waiters.push(tokio::spawn(async move { mediator.send(request).await }));
        tokio::task::yield_now().await;
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    // Two shards, each flushed once when it reached two items.
    let recorded = batches.lock();
    assert_eq!(recorded.len(), 2);
    for batch in recorded.iter() {
        assert_eq!(batch.len(), 2);
    }
}

#[tokio::test]
async fn overflow_fails_fast_with_unavailable() {
    struct StuckHandler;

    #[async_trait]
    impl BatchHandler<Lookup> for StuckHandler {
        async fn handle_batch(
            &self,
            requests: Vec<Lookup>,
            _ctx: &MessageContext,
        ) -> CatgaResult<Vec<CatgaResult<u64>>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(requests.into_iter().map(|r| Ok(r.key)).collect())
        }
    }

    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            StuckHandler,
            BatchOptions::default()
                .with_max_batch_size(1)
                .with_max_queue_length(2)
                .with_batch_timeout(Duration::from_millis(10)),
        )
        .build()
        .unwrap();

    // First item is pulled into a flush that never finishes; two more fill
    // the queue; the next submit must fail fast.
    let mut held = Vec::new();
    for key in 0..3u64 {
        let mediator = mediator.clone();
        held.push(tokio::spawn(async move { mediator.send(lookup(key)).await }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = mediator.send(lookup(99)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(err.code(), "batch_overflow");

    for handle in held {
        handle.abort();
    }
}

#[tokio::test]
async fn flush_error_reaches_every_waiter() {
    struct FailingHandler;

    #[async_trait]
    impl BatchHandler<Lookup> for FailingHandler {
        async fn handle_batch(
            &self,
            _requests: Vec<Lookup>,
            _ctx: &MessageContext,
        ) -> CatgaResult<Vec<CatgaResult<u64>>> {
            Err(CatgaError::unavailable("backend_down", "no backend"))
        }
    }

    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            FailingHandler,
            BatchOptions::default()
                .with_max_batch_size(3)
                .with_batch_timeout(Duration::from_secs(30)),
        )
        .build()
        .unwrap();

    let mut waiters = Vec::new();
    for key in 0..3u64 {
        let mediator = mediator.clone();
        waiters.push(tokio::spawn(async move { mediator.send(lookup(key)).await }));
    }
    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "backend_down");
    }
}

#[tokio::test]
async fn abandoned_waiter_does_not_stop_the_flush() {
    let (handler, _batches, flushes) = DoublingHandler::new();
    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(
            handler,
            BatchOptions::default()
                .with_max_batch_size(2)
                .with_batch_timeout(Duration::from_millis(100)),
        )
        .build()
        .unwrap();

    // The caller gives up immediately; the item still flushes.
    {
        let mediator = mediator.clone();
        let abandoned = tokio::spawn(async move { mediator.send(lookup(1)).await });
        abandoned.abort();
    }

    let result = mediator.send(lookup(2)).await.unwrap();
    assert_eq!(result, 4);
    assert!(flushes.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn per_type_options_override_scheduler_defaults() {
    let (handler, batches, _flushes) = DoublingHandler::new();
    let options = BatchOptions::default()
        .with_max_batch_size(2)
        .with_batch_timeout(Duration::from_secs(30))
        .with_flush_degree(1);

    let mediator = Catga::builder()
        .register_batch_handler::<Lookup, _>(handler, options)
        .build()
        .unwrap();

    let mut waiters = Vec::new();
    for key in 0..2u64 {
        let mediator = mediator.clone();
        waiters.push(tokio::spawn(async move { mediator.send(lookup(key)).await }));
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(batches.lock()[0].len(), 2);
}
