//! Leader election with lease renewal.
//!
//! An [`ElectionRunner`] heartbeats one election name: acquire when
//! follower, extend when leader, broadcast status changes over a watch
//! channel. Workers gate themselves through [`LeaderGuard`].
//!
//! A single winner per election name is guaranteed by the Redis elector;
//! the in-memory elector only coordinates within one process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use catga_common::{CatgaError, CatgaResult};

use crate::error::{Result, StandbyError};

/// Who currently leads an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub node_id: String,
    pub since: DateTime<Utc>,
}

/// Single-writer selection per election name.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// This node's identity in elections.
    fn node_id(&self) -> &str;

    /// Attempt to become leader of `name`. `true` only for the winner.
    async fn try_acquire_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool>;

    /// Renew an existing lease; `false` means leadership was lost.
    async fn extend_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool>;

    /// Give up leadership of `name` if held.
    async fn resign(&self, name: &str) -> CatgaResult<()>;

    /// The current leader, if any.
    async fn leader(&self, name: &str) -> CatgaResult<Option<LeaderInfo>>;

    async fn is_leader(&self, name: &str) -> CatgaResult<bool> {
        Ok(self
            .leader(name)
            .await?
            .map(|info| info.node_id == self.node_id())
            .unwrap_or(false))
    }
}

// ============================================================================
// In-memory elector (single-process stub)
// ============================================================================

struct MemoryLease {
    node_id: String,
    since: DateTime<Utc>,
    expires_at: Instant,
}

/// Process-local elector. No cross-process guarantee.
pub struct MemoryLeaderElector {
    node_id: String,
    elections: DashMap<String, MemoryLease>,
}

impl MemoryLeaderElector {
    pub fn new() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            elections: DashMap::new(),
        }
    }

    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            elections: DashMap::new(),
        }
    }
}

impl Default for MemoryLeaderElector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderElector for MemoryLeaderElector {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn try_acquire_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool> {
        let now = Instant::now();
        let mut won = false;
        let mut lease = self.elections.entry(name.to_string()).or_insert_with(|| {
            won = true;
            MemoryLease {
                node_id: self.node_id.clone(),
                since: Utc::now(),
                expires_at: now + ttl,
            }
        });
        if !won && lease.expires_at <= now {
            lease.node_id = self.node_id.clone();
            lease.since = Utc::now();
            lease.expires_at = now + ttl;
            won = true;
        } else if !won && lease.node_id == self.node_id {
            // Re-acquisition by the current leader acts as renewal.
            lease.expires_at = now + ttl;
            won = true;
        }
        Ok(won)
    }

    async fn extend_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool> {
        let now = Instant::now();
        match self.elections.get_mut(name) {
            Some(mut lease) if lease.node_id == self.node_id && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resign(&self, name: &str) -> CatgaResult<()> {
        self.elections
            .remove_if(name, |_, lease| lease.node_id == self.node_id);
        Ok(())
    }

    async fn leader(&self, name: &str) -> CatgaResult<Option<LeaderInfo>> {
        Ok(self.elections.get(name).and_then(|lease| {
            if lease.expires_at > Instant::now() {
                Some(LeaderInfo {
                    node_id: lease.node_id.clone(),
                    since: lease.since,
                })
            } else {
                None
            }
        }))
    }
}

// ============================================================================
// Redis elector
// ============================================================================

const EXTEND_SCRIPT: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if current and string.find(current, ARGV[1] .. "|", 1, true) == 1 then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RESIGN_SCRIPT: &str = r#"
    local current = redis.call("GET", KEYS[1])
    if current and string.find(current, ARGV[1] .. "|", 1, true) == 1 then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

/// Redis elector: the election key holds `<node_id>|<since_ms>` under
/// `SET NX PX`, so acquisition is atomic and leases lapse on their own.
pub struct RedisLeaderElector {
    conn: ConnectionManager,
    node_id: String,
}

impl RedisLeaderElector {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            node_id: Uuid::new_v4().to_string(),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| StandbyError::Endpoint {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    fn key(name: &str) -> String {
        format!("leader:{name}")
    }

    fn map_err(err: redis::RedisError) -> CatgaError {
        CatgaError::unavailable_from("redis", err)
    }
}

#[async_trait]
impl LeaderElector for RedisLeaderElector {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn try_acquire_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool> {
        let value = format!("{}|{}", self.node_id, Utc::now().timestamp_millis());
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if acquired.is_some() {
            return Ok(true);
        }
        // Losing the SET race still counts as leading when we already hold
        // the key; treat it as a renewal.
        self.extend_leadership(name, ttl).await
    }

    async fn extend_leadership(&self, name: &str, ttl: Duration) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(Self::key(name))
            .arg(&self.node_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(extended == 1)
    }

    async fn resign(&self, name: &str) -> CatgaResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::Script::new(RESIGN_SCRIPT)
            .key(Self::key(name))
            .arg(&self.node_id)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn leader(&self, name: &str) -> CatgaResult<Option<LeaderInfo>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(name))
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(raw.and_then(|value| {
            let (node_id, since_ms) = value.split_once('|')?;
            let since_ms: i64 = since_ms.parse().ok()?;
            Some(LeaderInfo {
                node_id: node_id.to_string(),
                since: DateTime::from_timestamp_millis(since_ms)?,
            })
        }))
    }
}

// ============================================================================
// Election runner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    Leader,
    Follower,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Election this runner competes in.
    pub election_name: String,
    /// Lease ttl; leadership lapses this long after the last heartbeat.
    pub lease_ttl: Duration,
    /// Heartbeat interval; must be shorter than the ttl.
    pub heartbeat_interval: Duration,
}

impl ElectionConfig {
    pub fn new(election_name: impl Into<String>) -> Self {
        Self {
            election_name: election_name.into(),
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Maintains leadership for one election name on a heartbeat.
pub struct ElectionRunner {
    elector: Arc<dyn LeaderElector>,
    config: ElectionConfig,
    running: AtomicBool,
    cancel: CancellationToken,
    status_tx: watch::Sender<LeadershipStatus>,
    status_rx: watch::Receiver<LeadershipStatus>,
}

impl ElectionRunner {
    pub fn new(elector: Arc<dyn LeaderElector>, config: ElectionConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(LeadershipStatus::Unknown);
        Self {
            elector,
            config,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            status_tx,
            status_rx,
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.status_rx.borrow() == LeadershipStatus::Leader
    }

    pub fn status(&self) -> LeadershipStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status_rx.clone()
    }

    /// Start the heartbeat loop.
    pub fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyStarted);
        }

        info!(
            node_id = %self.elector.node_id(),
            election = %self.config.election_name,
            "starting leader election"
        );

        let runner = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = runner.cancel.cancelled() => {
                        if runner.is_leader() {
                            if let Err(err) = runner.elector.resign(&runner.config.election_name).await {
                                error!(error = %err, "failed to resign leadership");
                            }
                        }
                        runner.set_status(LeadershipStatus::Follower);
                        break;
                    }
                    _ = ticker.tick() => {
                        runner.tick_once().await;
                    }
                }
            }
        });

        Ok(())
    }

    /// One heartbeat: extend when leading, try to acquire otherwise.
    pub async fn tick_once(&self) {
        let name = &self.config.election_name;
        let ttl = self.config.lease_ttl;

        if self.is_leader() {
            match self.elector.extend_leadership(name, ttl).await {
                Ok(true) => debug!(election = %name, "extended leadership lease"),
                Ok(false) => {
                    warn!(election = %name, "lost leadership");
                    self.set_status(LeadershipStatus::Follower);
                }
                Err(err) => {
                    error!(election = %name, error = %err, "failed to extend lease");
                    self.set_status(LeadershipStatus::Follower);
                }
            }
        } else {
            match self.elector.try_acquire_leadership(name, ttl).await {
                Ok(true) => self.set_status(LeadershipStatus::Leader),
                Ok(false) => self.set_status(LeadershipStatus::Follower),
                Err(err) => {
                    error!(election = %name, error = %err, "election attempt failed");
                    self.set_status(LeadershipStatus::Unknown);
                }
            }
        }
    }

    fn set_status(&self, status: LeadershipStatus) {
        let was_leader = self.is_leader();
        let _ = self.status_tx.send(status);
        let is_now = status == LeadershipStatus::Leader;
        if was_leader != is_now {
            if is_now {
                info!(election = %self.config.election_name, "became leader");
            } else {
                info!(election = %self.config.election_name, "no longer leader");
            }
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Gates work on leadership status.
pub struct LeaderGuard {
    runner: Arc<ElectionRunner>,
}

impl LeaderGuard {
    pub fn new(runner: Arc<ElectionRunner>) -> Self {
        Self { runner }
    }

    pub fn should_process(&self) -> bool {
        self.runner.is_leader()
    }

    /// Run `f` only while leading.
    pub async fn run_if_leader<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if self.runner.is_leader() {
            Some(f().await)
        } else {
            None
        }
    }

    /// Block until this node leads the election.
    pub async fn wait_for_leadership(&self) {
        let mut rx = self.runner.subscribe();
        while *rx.borrow() != LeadershipStatus::Leader {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_elector_single_winner_per_name() {
        let a = MemoryLeaderElector::with_node_id("node-a");
        let ttl = Duration::from_secs(30);

        assert!(a.try_acquire_leadership("outbox", ttl).await.unwrap());
        assert!(a.is_leader("outbox").await.unwrap());

        // A second node in the same process cannot take the name over.
        let elections = a;
        let leader = elections.leader("outbox").await.unwrap().unwrap();
        assert_eq!(leader.node_id, "node-a");
    }

    #[tokio::test]
    async fn memory_elector_resign_frees_the_name() {
        let elector = MemoryLeaderElector::with_node_id("node-a");
        let ttl = Duration::from_secs(30);
        assert!(elector.try_acquire_leadership("inbox", ttl).await.unwrap());

        elector.resign("inbox").await.unwrap();
        assert!(elector.leader("inbox").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_elector_lease_expires() {
        let elector = MemoryLeaderElector::with_node_id("node-a");
        assert!(elector
            .try_acquire_leadership("dlq", Duration::from_millis(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(elector.leader("dlq").await.unwrap().is_none());
        assert!(!elector
            .extend_leadership("dlq", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn runner_acquires_and_reports_leadership() {
        let elector = Arc::new(MemoryLeaderElector::with_node_id("node-a"));
        let runner = Arc::new(ElectionRunner::new(
            elector,
            ElectionConfig::new("outbox")
                .with_lease_ttl(Duration::from_secs(5))
                .with_heartbeat_interval(Duration::from_millis(10)),
        ));

        assert_eq!(runner.status(), LeadershipStatus::Unknown);
        runner.tick_once().await;
        assert!(runner.is_leader());

        let guard = LeaderGuard::new(runner.clone());
        assert!(guard.should_process());
        assert_eq!(guard.run_if_leader(|| async { 1 }).await, Some(1));
    }

    #[tokio::test]
    async fn runner_starts_only_once() {
        let elector = Arc::new(MemoryLeaderElector::new());
        let runner = Arc::new(ElectionRunner::new(
            elector,
            ElectionConfig::new("outbox").with_heartbeat_interval(Duration::from_millis(50)),
        ));
        runner.clone().start().unwrap();
        assert!(runner.clone().start().is_err());
        runner.shutdown();
    }
}
