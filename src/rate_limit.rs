//! Client-side call rate limiter.
//!
//! Wraps a `governor` direct limiter. Every external call awaits a slot
//! first, whichever credential it is made with.

use crate::config::RateLimitConfig;
use governor::{DefaultDirectRateLimiter, Quota};
use tracing::debug;

/// Caps outgoing calls per second
pub struct CallLimiter {
    inner: DefaultDirectRateLimiter,
    per_second: u32,
}

impl CallLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(config.per_second).allow_burst(config.per_second);
        Self {
            inner: DefaultDirectRateLimiter::direct(quota),
            per_second: config.per_second.get(),
        }
    }

    /// Wait until `calls` slots are free, one slot at a time.
    pub async fn acquire(&self, calls: u32) {
        for _ in 0..calls {
            if self.inner.check().is_err() {
                debug!(per_second = self.per_second, "Rate limit reached, waiting for slot");
                self.inner.until_ready().await;
            }
        }
    }

    /// Configured calls per second
    pub fn per_second(&self) -> u32 {
        self.per_second
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_burst_is_immediate() -> crate::Result<()> {
        let limiter = CallLimiter::new(RateLimitConfig::per_second(8)?);
        let start = Instant::now();
        limiter.acquire(8).await;
        assert!(start.elapsed() < Duration::from_millis(500));
        Ok(())
    }

    #[tokio::test]
    async fn test_excess_calls_wait() -> crate::Result<()> {
        let limiter = CallLimiter::new(RateLimitConfig::per_second(4)?);
        let start = Instant::now();
        limiter.acquire(5).await;
        // fifth call needs a replenished slot (250ms at 4/s)
        assert!(start.elapsed() >= Duration::from_millis(200));
        Ok(())
    }
}
