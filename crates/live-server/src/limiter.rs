//! Token bucket gating broadcast fan-out.
//!
//! One token is added every `interval`, up to `burst` tokens. A zero
//! interval disables limiting.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::LiveError;
use crate::shutdown::Shutdown;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        RateLimiter {
            interval,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available, otherwise report how long
    /// until the next one.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        self.refill(&mut bucket, now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return Ok(());
        }
        let next = bucket.last_refill + self.interval;
        Err(next.saturating_duration_since(now))
    }

    /// Wait for a token, or fail with `Cancelled` once `shutdown` fires.
    pub async fn acquire(&self, shutdown: &mut Shutdown) -> Result<(), LiveError> {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.recv() => return Err(LiveError::Cancelled),
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if bucket.tokens >= self.burst {
            bucket.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = elapsed.as_nanos() / self.interval.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        bucket.tokens = bucket.tokens.saturating_add(earned).min(self.burst);
        bucket.last_refill = if bucket.tokens >= self.burst {
            now
        } else {
            bucket.last_refill + self.interval * earned
        };
    }
}
