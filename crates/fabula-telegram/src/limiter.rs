//! Per-chat token bucket for edits and deletes.
//!
//! Telegram throttles per-chat mutation calls; the bucket keeps us under 20
//! operations per minute per chat. Overflow callers wait for a token, they
//! are never dropped.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Mutex;

/// Operations allowed per chat per minute.
const BUCKET_CAPACITY: f64 = 20.0;
const REFILL_PER_SEC: f64 = BUCKET_CAPACITY / 60.0;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_CAPACITY,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or return how long to wait for one.
    fn try_take(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * REFILL_PER_SEC).min(BUCKET_CAPACITY);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / REFILL_PER_SEC))
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<i64, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the chat has a token available, then consume it.
    pub async fn acquire(&self, chat_id: i64) {
        loop {
            let wait = {
                let bucket = self
                    .buckets
                    .entry(chat_id)
                    .or_insert_with(|| Mutex::new(Bucket::new()));
                let mut guard = bucket.lock().unwrap();
                guard.try_take()
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn over_capacity_waits_for_refill() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            limiter.acquire(1).await;
        }
        let start = Instant::now();
        limiter.acquire(1).await;
        // One token refills in 3 s (20 per 60 s).
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn chats_do_not_share_buckets() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            limiter.acquire(1).await;
        }
        let start = Instant::now();
        limiter.acquire(2).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
