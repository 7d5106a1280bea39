//! Token bucket rate limiting for backend calls
//!
//! Buckets are keyed by name so separate call classes can be throttled
//! independently. Each bucket refills continuously at
//! `rate_limit / time_window` tokens per second up to `burst` tokens, and
//! starts full.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Bucket used when callers do not name one
pub const DEFAULT_BUCKET: &str = "default";

/// Snapshot of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStatus {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens added per second
    pub rate: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_update = now;
    }
}

/// Shared token bucket rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl RateLimiter {
    /// `rate_limit` acquisitions per `time_window`, bursting up to `rate_limit`
    pub fn new(rate_limit: u32, time_window: Duration) -> Self {
        Self::with_burst(rate_limit, time_window, rate_limit)
    }

    pub fn with_burst(rate_limit: u32, time_window: Duration, burst: u32) -> Self {
        let window = time_window.as_secs_f64().max(f64::EPSILON);
        Self {
            rate: f64::from(rate_limit.max(1)) / window,
            capacity: f64::from(burst.max(1)),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take a token from `key` without waiting
    pub async fn try_acquire(&self, key: &str) -> bool {
        self.take(key).await.is_ok()
    }

    /// Take a token from `key`, sleeping until one is available
    pub async fn acquire(&self, key: &str) {
        loop {
            match self.take(key).await {
                Ok(()) => return,
                Err(wait) => {
                    trace!(bucket = key, wait_ms = wait.as_millis() as u64, "Rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Current state of `key`, if it has been used
    pub async fn bucket_status(&self, key: &str) -> Option<BucketStatus> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.get_mut(key)?;
        bucket.refill(self.rate, self.capacity);
        Some(BucketStatus {
            tokens: bucket.tokens,
            capacity: self.capacity,
            rate: self.rate,
        })
    }

    /// Take one token, or return how long until one is due.
    async fn take(&self, key: &str) -> std::result::Result<(), Duration> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity));
        bucket.refill(self.rate, self.capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.rate).max(Duration::from_millis(1)))
        }
    }
}
