//! Distributed locks with ttl-scoped ownership.
//!
//! Redis locking uses `SET NX PX` for acquisition and Lua check-and-act
//! scripts for extension and release, so a lapsed or stolen lock can never
//! be extended or released by its previous holder. Locks are not reentrant;
//! an orphaned lock simply lapses at its ttl.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use catga_common::{CatgaError, CatgaResult};

use crate::error::StandbyError;

/// Internal check-and-act operations a handle delegates to.
#[async_trait]
pub trait LockOps: Send + Sync {
    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> CatgaResult<bool>;
    async fn release(&self, resource: &str, token: &str) -> CatgaResult<bool>;
}

/// Owned lock. Operations are fenced by the acquisition token, so a handle
/// whose lock lapsed cannot affect the next holder. There is no implicit
/// release on drop; the ttl bounds orphaned locks.
pub struct LockHandle {
    resource: String,
    token: String,
    ops: Arc<dyn LockOps>,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Push the expiry out by `ttl`. `false` means the lock is no longer
    /// held by this handle.
    pub async fn extend(&self, ttl: Duration) -> CatgaResult<bool> {
        self.ops.extend(&self.resource, &self.token, ttl).await
    }

    /// Release the lock if still held.
    pub async fn release(self) -> CatgaResult<()> {
        let released = self.ops.release(&self.resource, &self.token).await?;
        if !released {
            debug!(resource = %self.resource, "lock already lapsed at release");
        }
        Ok(())
    }
}

/// Scoped mutual exclusion on a named resource.
#[async_trait]
pub trait DistributedLock: LockOps {
    /// Single attempt: `None` when another holder owns the resource.
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> CatgaResult<Option<LockHandle>>;

    /// Poll for the lock for up to `wait`; `None` when the wait lapses.
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
    ) -> CatgaResult<Option<LockHandle>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(handle) = self.try_acquire(resource, ttl).await? {
                return Ok(Some(handle));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
        }
    }
}

// ============================================================================
// In-memory lock
// ============================================================================

struct MemoryLockEntry {
    token: String,
    expires_at: Instant,
}

/// Single-process lock used by tests and embedded deployments.
#[derive(Default)]
pub struct MemoryLock {
    entries: Arc<DashMap<String, MemoryLockEntry>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockOps for MemoryLock {
    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> CatgaResult<bool> {
        let now = Instant::now();
        match self.entries.get_mut(resource) {
            Some(mut entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, token: &str) -> CatgaResult<bool> {
        Ok(self
            .entries
            .remove_if(resource, |_, entry| entry.token == token)
            .is_some())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> CatgaResult<Option<LockHandle>> {
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();
        let mut acquired = false;

        let mut entry = self
            .entries
            .entry(resource.to_string())
            .or_insert_with(|| {
                acquired = true;
                MemoryLockEntry {
                    token: token.clone(),
                    expires_at: now + ttl,
                }
            });
        if !acquired && entry.expires_at <= now {
            entry.token = token.clone();
            entry.expires_at = now + ttl;
            acquired = true;
        }
        drop(entry);

        if acquired {
            Ok(Some(LockHandle {
                resource: resource.to_string(),
                token,
                ops: Arc::new(Self {
                    entries: self.entries.clone(),
                }),
            }))
        } else {
            Ok(None)
        }
    }
}

// ============================================================================
// Redis lock
// ============================================================================

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

/// Redis-backed lock: `SET NX PX` acquisition, token-fenced Lua extension
/// and release.
pub struct RedisLock {
    conn: ConnectionManager,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> crate::Result<Self> {
        let client = redis::Client::open(url).map_err(|e| StandbyError::Endpoint {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn key(resource: &str) -> String {
        format!("lock:{resource}")
    }
}

#[async_trait]
impl LockOps for RedisLock {
    async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(Self::key(resource))
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CatgaError::unavailable_from("redis", e))?;
        Ok(extended == 1)
    }

    async fn release(&self, resource: &str, token: &str) -> CatgaResult<bool> {
        let mut conn = self.conn.clone();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(resource))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CatgaError::unavailable_from("redis", e))?;
        Ok(released == 1)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> CatgaResult<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::key(resource))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CatgaError::unavailable_from("redis", e))?;

        if acquired.is_some() {
            Ok(Some(LockHandle {
                resource: resource.to_string(),
                token,
                ops: Arc::new(Self {
                    conn: self.conn.clone(),
                }),
            }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_has_one_holder() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);

        let handle = lock.try_acquire("outbox", ttl).await.unwrap();
        assert!(handle.is_some());
        assert!(lock.try_acquire("outbox", ttl).await.unwrap().is_none());

        // A different resource is independent.
        assert!(lock.try_acquire("inbox", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn released_lock_is_reacquirable() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);

        let handle = lock.try_acquire("outbox", ttl).await.unwrap().unwrap();
        handle.release().await.unwrap();
        assert!(lock.try_acquire("outbox", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over_and_stale_handle_is_fenced() {
        let lock = MemoryLock::new();
        let stale = lock
            .try_acquire("outbox", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = lock
            .try_acquire("outbox", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());

        // The lapsed handle can neither extend nor release the new lock.
        assert!(!stale.extend(Duration::from_secs(30)).await.unwrap());
        stale.release().await.unwrap();
        assert!(lock
            .try_acquire("outbox", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn extend_pushes_expiry_out() {
        let lock = MemoryLock::new();
        let handle = lock
            .try_acquire("outbox", Duration::from_millis(40))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.extend(Duration::from_secs(30)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lock
            .try_acquire("outbox", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let lock = Arc::new(MemoryLock::new());
        let handle = lock
            .try_acquire("outbox", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.acquire("outbox", Duration::from_secs(30), Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.release().await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }
}
