//! Quota-based throttling over `governor`.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

/// Direct (unkeyed) rate limiter.
///
/// Wraps a governor limiter so callers deal in plain `u32` rates. Used by
/// the batch scheduler for per-type flush throttling and usable standalone.
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    pub fn per_minute(rate: NonZeroU32) -> Self {
        Self {
            inner: GovernorLimiter::direct(Quota::per_minute(rate)),
        }
    }

    pub fn per_second(rate: NonZeroU32) -> Self {
        Self {
            inner: GovernorLimiter::direct(Quota::per_second(rate)),
        }
    }

    /// Non-blocking admission check.
    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }

    /// Wait until the quota admits one more call.
    pub async fn until_ready(&self) {
        self.inner.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nonzero_ext::nonzero;

    #[test]
    fn admits_within_quota_then_rejects() {
        let limiter = RateLimiter::per_minute(nonzero!(2u32));
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[tokio::test]
    async fn until_ready_eventually_admits() {
        let limiter = RateLimiter::per_second(nonzero!(100u32));
        while limiter.check() {}
        limiter.until_ready().await;
    }
}
