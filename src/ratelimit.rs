//! Global token-bucket admission control.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Token bucket holding up to `burst` tokens, refilled continuously at
/// `per_minute / 60` tokens per second. Every admitted request costs one.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    /// Returns `None` when `per_minute` is zero, meaning "no limit".
    /// A zero burst is treated as one so the limiter can ever admit anything.
    #[must_use]
    pub fn new(per_minute: u32, burst: u32) -> Option<Self> {
        if per_minute == 0 {
            return None;
        }
        let capacity = f64::from(burst.max(1));
        Some(Self {
            capacity,
            refill_per_sec: f64::from(per_minute) / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                updated: Instant::now(),
            }),
        })
    }

    /// Take one token, or report how long until one is available.
    pub fn check(&self) -> Result<(), Duration> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        // Round partial seconds up so a fast client doesn't retry too early
        let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
        Err(Duration::from_secs(wait.ceil().max(1.0) as u64))
    }
}
