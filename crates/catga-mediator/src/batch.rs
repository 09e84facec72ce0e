//! Auto-batching scheduler.
//!
//! Requests of one type are coalesced into shards (optionally keyed per
//! request) and handed to a [`BatchHandler`] in one invocation per flush.
//! Each shard owns a bounded queue and a worker task, so ordering within a
//! shard is FIFO and overflow fails fast without blocking the caller.
//!
//! A shard flushes when its queue reaches `max_batch_size` or the oldest
//! queued item has waited `batch_timeout`. Flush concurrency across shards
//! is capped by a bulkhead when `flush_degree > 0`. Idle or surplus shards
//! are drained and removed; draining never loses items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use catga_common::telemetry::counters;
use catga_common::{CatgaError, CatgaResult, MessageContext, Request};
use catga_resilience::{Bulkhead, RateLimiter};

/// Scheduler tuning; per-type registrations override these defaults.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Flush as soon as a shard holds this many items.
    pub max_batch_size: usize,
    /// Flush once the oldest queued item has waited this long.
    pub batch_timeout: Duration,
    /// Bounded queue per shard; overflow fails fast with `Unavailable`.
    pub max_queue_length: usize,
    /// Concurrent flushes across all shards; 0 = sequential per shard with
    /// no cross-shard limit.
    pub flush_degree: usize,
    /// Shards beyond this are evicted oldest-activity first.
    pub max_shards: usize,
    /// Idle shards older than this are drained and removed.
    pub shard_idle_ttl: Duration,
    /// Optional flush rate cap.
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_timeout: Duration::from_millis(1_000),
            max_queue_length: 1_024,
            flush_degree: 0,
            max_shards: 128,
            shard_idle_ttl: Duration::from_secs(60),
            rate_limit_per_minute: None,
        }
    }
}

impl BatchOptions {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_max_queue_length(mut self, length: usize) -> Self {
        self.max_queue_length = length.max(1);
        self
    }

    pub fn with_flush_degree(mut self, degree: usize) -> Self {
        self.flush_degree = degree;
        self
    }

    pub fn with_max_shards(mut self, shards: usize) -> Self {
        self.max_shards = shards.max(1);
        self
    }

    pub fn with_shard_idle_ttl(mut self, ttl: Duration) -> Self {
        self.shard_idle_ttl = ttl;
        self
    }

    pub fn with_rate_limit_per_minute(mut self, rate: u32) -> Self {
        self.rate_limit_per_minute = Some(rate);
        self
    }
}

/// Handles one flushed batch. Results must be positional: `results[i]`
/// answers `requests[i]`.
#[async_trait]
pub trait BatchHandler<R: Request>: Send + Sync + 'static {
    async fn handle_batch(
        &self,
        requests: Vec<R>,
        ctx: &MessageContext,
    ) -> CatgaResult<Vec<CatgaResult<R::Response>>>;
}

pub(crate) type KeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;

struct PendingItem<R: Request> {
    request: R,
    ctx: MessageContext,
    enqueued_at: Instant,
    waiter: oneshot::Sender<CatgaResult<R::Response>>,
}

struct ShardRef<R: Request> {
    tx: mpsc::Sender<PendingItem<R>>,
    last_activity: Arc<Mutex<Instant>>,
}

impl<R: Request> Clone for ShardRef<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            last_activity: self.last_activity.clone(),
        }
    }
}

struct SchedulerInner<R: Request> {
    handler: Arc<dyn BatchHandler<R>>,
    options: BatchOptions,
    key_fn: Option<KeyFn<R>>,
    shards: DashMap<Arc<str>, ShardRef<R>>,
    flush_gate: Option<Arc<Bulkhead>>,
    rate: Option<Arc<RateLimiter>>,
    janitor_started: AtomicBool,
}

/// Per-type sharded batching front.
pub struct BatchScheduler<R: Request> {
    inner: Arc<SchedulerInner<R>>,
}

impl<R: Request> BatchScheduler<R> {
    pub(crate) fn new(
        handler: Arc<dyn BatchHandler<R>>,
        options: BatchOptions,
        key_fn: Option<KeyFn<R>>,
    ) -> Self {
        let flush_gate = (options.flush_degree > 0)
            .then(|| Arc::new(Bulkhead::new(options.flush_degree, options.max_shards)));
        let rate = options
            .rate_limit_per_minute
            .and_then(std::num::NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::per_minute(rpm)));

        Self {
            inner: Arc::new(SchedulerInner {
                handler,
                options,
                key_fn,
                shards: DashMap::new(),
                flush_gate,
                rate,
                janitor_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Enqueue one request and wait for its result from the flush that
    /// carries it. Dropping the returned future abandons only the waiter;
    /// the flush still runs to completion.
    pub async fn submit(&self, request: R, ctx: MessageContext) -> CatgaResult<R::Response> {
        self.ensure_janitor();

        let key: Arc<str> = match &self.inner.key_fn {
            Some(key_fn) => Arc::from(key_fn(&request).as_str()),
            None => Arc::from(""),
        };

        let (done_tx, done_rx) = oneshot::channel();
        let item = PendingItem {
            request,
            ctx,
            enqueued_at: Instant::now(),
            waiter: done_tx,
        };
        self.enqueue(key, item)?;
        self.enforce_max_shards();

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(CatgaError::internal(
                "flush_abandoned",
                "batch flush dropped its waiters",
            )),
        }
    }

    fn enqueue(&self, key: Arc<str>, item: PendingItem<R>) -> CatgaResult<()> {
        let mut item = item;
        // A closed channel means the shard was evicted between lookup and
        // send; retry once against a fresh shard.
        for _ in 0..2 {
            let shard = self.shard_for(&key);
            *shard.last_activity.lock() = Instant::now();
            match shard.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!(counters::BATCH_OVERFLOW).increment(1);
                    return Err(CatgaError::unavailable(
                        "batch_overflow",
                        "batch shard queue is full",
                    ));
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    item = returned;
                    self.inner.shards.remove_if(&key, |_, s| s.tx.is_closed());
                }
            }
        }
        Err(CatgaError::unavailable(
            "shard_unavailable",
            "batch shard was evicted during enqueue",
        ))
    }

    fn shard_for(&self, key: &Arc<str>) -> ShardRef<R> {
        if let Some(existing) = self.inner.shards.get(key) {
            return existing.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.options.max_queue_length);
        let shard = ShardRef {
            tx,
            last_activity: Arc::new(Mutex::new(Instant::now())),
        };

        use dashmap::mapref::entry::Entry;
        match self.inner.shards.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                slot.insert(shard.clone());
                tokio::spawn(shard_worker(
                    rx,
                    self.inner.handler.clone(),
                    self.inner.options.clone(),
                    self.inner.flush_gate.clone(),
                    self.inner.rate.clone(),
                    key.clone(),
                ));
                debug!(shard = %key, "created batch shard");
                shard
            }
        }
    }

    /// Evict oldest-activity shards beyond `max_shards`. Dropping the
    /// sender drains the worker: it flushes what is queued, then exits.
    fn enforce_max_shards(&self) {
        let excess = self
            .inner
            .shards
            .len()
            .saturating_sub(self.inner.options.max_shards);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(Arc<str>, Instant)> = self
            .inner
            .shards
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value().last_activity.lock()))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);

        for (key, _) in by_age.into_iter().take(excess) {
            if self.inner.shards.remove(&key).is_some() {
                debug!(shard = %key, "evicted batch shard (max shards)");
            }
        }
    }

    fn ensure_janitor(&self) {
        if self.inner.janitor_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<SchedulerInner<R>> = Arc::downgrade(&self.inner);
        let period = self
            .inner
            .options
            .shard_idle_ttl
            .min(Duration::from_secs(5))
            .max(Duration::from_millis(50));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let now = Instant::now();
                let ttl = inner.options.shard_idle_ttl;
                inner.shards.retain(|key, shard| {
                    let idle = now.duration_since(*shard.last_activity.lock());
                    if idle >= ttl {
                        debug!(shard = %key, idle_ms = idle.as_millis() as u64, "evicted idle batch shard");
                        false
                    } else {
                        true
                    }
                });
            }
        });
    }
}

async fn shard_worker<R: Request>(
    mut rx: mpsc::Receiver<PendingItem<R>>,
    handler: Arc<dyn BatchHandler<R>>,
    options: BatchOptions,
    flush_gate: Option<Arc<Bulkhead>>,
    rate: Option<Arc<RateLimiter>>,
    key: Arc<str>,
) {
    let mut buffer: Vec<PendingItem<R>> = Vec::new();

    loop {
        let first = match rx.recv().await {
            Some(item) => item,
            None => break,
        };
        let deadline = tokio::time::Instant::from_std(first.enqueued_at + options.batch_timeout);
        buffer.push(first);

        // Soak up whatever is already queued before arming the timer, so a
        // burst re-batches instead of trickling out one item at a time.
        while buffer.len() < options.max_batch_size {
            match rx.try_recv() {
                Ok(item) => buffer.push(item),
                Err(_) => break,
            }
        }

        let mut closed = false;
        while buffer.len() < options.max_batch_size && !closed {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                item = rx.recv() => match item {
                    Some(item) => buffer.push(item),
                    None => closed = true,
                }
            }
        }

        let batch: Vec<PendingItem<R>> = buffer.drain(..).collect();
        flush_batch(&handler, &flush_gate, &rate, &key, batch).await;

        if closed {
            break;
        }
    }
    debug!(shard = %key, "batch shard drained");
}

async fn flush_batch<R: Request>(
    handler: &Arc<dyn BatchHandler<R>>,
    flush_gate: &Option<Arc<Bulkhead>>,
    rate: &Option<Arc<RateLimiter>>,
    key: &Arc<str>,
    batch: Vec<PendingItem<R>>,
) {
    if batch.is_empty() {
        return;
    }

    let _permit = match flush_gate {
        Some(gate) => match gate.acquire().await {
            Ok(permit) => Some(permit),
            Err(err) => {
                fail_all(batch, err);
                return;
            }
        },
        None => None,
    };
    if let Some(rate) = rate {
        rate.until_ready().await;
    }

    let requests: Vec<R> = batch.iter().map(|item| item.request.clone()).collect();
    let ctx = batch[0].ctx.clone();
    debug!(shard = %key, size = batch.len(), "flushing batch");

    match handler.handle_batch(requests, &ctx).await {
        Ok(results) if results.len() == batch.len() => {
            for (item, result) in batch.into_iter().zip(results) {
                let _ = item.waiter.send(result);
            }
        }
        Ok(results) => {
            let err = CatgaError::internal(
                "batch_result_mismatch",
                format!("flush returned {} results", results.len()),
            );
            fail_all(batch, err);
        }
        Err(err) => fail_all(batch, err),
    }
}

/// A flush that raises surfaces the same error to every waiter.
fn fail_all<R: Request>(batch: Vec<PendingItem<R>>, err: CatgaError) {
    for item in batch {
        let _ = item.waiter.send(Err(err.clone()));
    }
}
