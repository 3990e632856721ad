//! Per-key token-bucket limiter.

use crate::decision::{Decision, RateLimit};
use crate::keyed::KeyedMap;
use gatehouse_core::{Clock, ConfigError, SystemClock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Refillable token store for one key.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct TokenBucketInner {
    rate: u32,
    capacity: u32,
    interval: Duration,
    clock: Arc<dyn Clock>,
    buckets: KeyedMap<Bucket>,
}

impl TokenBucketInner {
    /// Refills `bucket` in whole-interval steps, then reports the instant the
    /// current period resets.
    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill);
        let periods = (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u64;
        if periods > 0 {
            let added = periods.saturating_mul(self.rate as u64) as f64;
            bucket.tokens = (bucket.tokens + added).min(self.capacity as f64);
            bucket.last_refill = now;
        }
    }

    fn decide(&self, key: &str, consume: bool) -> Decision {
        let now = self.clock.now();
        let entry = self.buckets.get_or_insert_with(key, || Bucket {
            tokens: self.capacity as f64,
            last_refill: now,
            last_seen: now,
        });
        let mut bucket = entry.lock().unwrap_or_else(|e| e.into_inner());
        bucket.last_seen = now;
        self.refill(&mut bucket, now);

        let reset = bucket.last_refill + self.interval;
        let reset_after = reset.saturating_duration_since(now);

        if bucket.tokens >= 1.0 {
            if consume {
                bucket.tokens -= 1.0;
            }
            Decision::allowed(self.capacity, bucket.tokens as u32, reset_after)
        } else {
            Decision::denied(self.capacity, reset_after, reset_after)
        }
    }
}

/// Keyed token-bucket rate limiter.
///
/// Buckets are created lazily at capacity on first touch and refilled at
/// `rate` tokens per `interval`. A background sweep evicts buckets idle
/// longer than ten intervals.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    inner: Arc<TokenBucketInner>,
    cancel: CancellationToken,
}

impl TokenBucketLimiter {
    /// Creates a limiter that grants `capacity` burst tokens, refilled at
    /// `rate` tokens per `interval`.
    ///
    /// The idle-bucket sweep starts immediately when called inside a tokio
    /// runtime; outside one, the limiter still works but nothing is evicted.
    pub fn new(rate: u32, capacity: u32, interval: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(rate, capacity, interval, Arc::new(SystemClock))
    }

    /// Same as [`TokenBucketLimiter::new`] with an explicit clock.
    pub fn with_clock(
        rate: u32,
        capacity: u32,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if rate == 0 {
            return Err(ConfigError::NonPositive { field: "rate" });
        }
        if capacity == 0 {
            return Err(ConfigError::NonPositive { field: "capacity" });
        }
        if interval.is_zero() {
            return Err(ConfigError::NonPositive { field: "interval" });
        }

        let inner = Arc::new(TokenBucketInner {
            rate,
            capacity,
            interval,
            clock,
            buckets: KeyedMap::new(),
        });
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = Arc::downgrade(&inner);
            let token = cancel.clone();
            let idle_limit = interval.saturating_mul(10);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(idle_limit.max(Duration::from_millis(100)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = sweep.upgrade() else { break };
                            let now = inner.clock.now();
                            let evicted = inner
                                .buckets
                                .retain(|b| now.duration_since(b.last_seen) <= idle_limit);
                            if evicted > 0 {
                                tracing::debug!(evicted, "evicted idle token buckets");
                            }
                        }
                    }
                }
            });
        }

        Ok(Self { inner, cancel })
    }

    /// Stops the background sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.cancel.cancel();
        }
    }
}

impl RateLimit for TokenBucketLimiter {
    fn allow(&self, key: &str) -> Decision {
        self.inner.decide(key, true)
    }

    fn check(&self, key: &str) -> Decision {
        self.inner.decide(key, false)
    }

    fn refund(&self, key: &str) {
        if let Some(entry) = self.inner.buckets.get(key) {
            let mut bucket = entry.lock().unwrap_or_else(|e| e.into_inner());
            bucket.tokens = (bucket.tokens + 1.0).min(self.inner.capacity as f64);
        }
    }

    fn reset(&self, key: &str) {
        self.inner.buckets.remove(key);
    }

    fn tracked_keys(&self) -> usize {
        self.inner.buckets.len()
    }
}
