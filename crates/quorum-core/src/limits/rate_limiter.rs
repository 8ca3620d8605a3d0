//! Per-agent token bucket guarding submit paths.
//!
//! Buckets are process-local; restarting the host process resets them.
//! They protect the store from a single misbehaving agent, not from the
//! fleet as a whole.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by agent id.
///
/// Default shape: capacity 100 tokens, 10 tokens/second refill, one token
/// per submit.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// Creates a limiter with the given capacity and refill rate.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
        }
    }

    /// Attempts to take one token for `agent_id` without blocking.
    ///
    /// Returns `false` when the bucket is exhausted.
    pub fn allow(&self, agent_id: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let bucket = buckets
            .entry(agent_id.to_string())
            .or_insert(Bucket { tokens: self.capacity, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            warn!(agent_id, "rate limit exhausted");
            false
        }
    }

    /// Blocks until a token is available or `timeout` elapses, polling at
    /// 10 ms. Returns `false` on timeout.
    pub fn wait(&self, agent_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.allow(agent_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
