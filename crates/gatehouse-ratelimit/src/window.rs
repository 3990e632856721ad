//! Per-key sliding-window limiter.

use crate::decision::{Decision, RateLimit};
use crate::keyed::KeyedMap;
use gatehouse_core::{Clock, ConfigError, SystemClock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Ordered admission timestamps for one key.
#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
}

struct SlidingWindowInner {
    limit: u32,
    duration: Duration,
    clock: Arc<dyn Clock>,
    windows: KeyedMap<Window>,
}

impl SlidingWindowInner {
    fn decide(&self, key: &str, consume: bool) -> Decision {
        let now = self.clock.now();
        let entry = self.windows.get_or_insert_with(key, || Window {
            hits: VecDeque::with_capacity(self.limit as usize),
        });
        let mut window = entry.lock().unwrap_or_else(|e| e.into_inner());

        // Drop everything at or before the window's trailing edge.
        while let Some(&oldest) = window.hits.front() {
            if now.duration_since(oldest) >= self.duration {
                window.hits.pop_front();
            } else {
                break;
            }
        }

        let reset_after = window
            .hits
            .front()
            .map(|&oldest| (oldest + self.duration).saturating_duration_since(now))
            .unwrap_or_default();

        if (window.hits.len() as u32) < self.limit {
            if consume {
                window.hits.push_back(now);
            }
            let remaining = self.limit - window.hits.len() as u32;
            Decision::allowed(self.limit, remaining, reset_after)
        } else {
            Decision::denied(self.limit, reset_after, reset_after)
        }
    }
}

/// Keyed sliding-window rate limiter.
///
/// Each key holds the ordered timestamps admitted within the rolling
/// `duration`; a request is admitted while fewer than `limit` remain inside
/// the window. A background sweep drops windows that are empty or whose
/// newest entry is older than twice the duration.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    inner: Arc<SlidingWindowInner>,
    cancel: CancellationToken,
}

impl SlidingWindowLimiter {
    /// Creates a limiter admitting at most `limit` requests per rolling
    /// `duration`.
    pub fn new(limit: u32, duration: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(limit, duration, Arc::new(SystemClock))
    }

    /// Same as [`SlidingWindowLimiter::new`] with an explicit clock.
    pub fn with_clock(
        limit: u32,
        duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::NonPositive { field: "limit" });
        }
        if duration.is_zero() {
            return Err(ConfigError::NonPositive { field: "duration" });
        }

        let inner = Arc::new(SlidingWindowInner {
            limit,
            duration,
            clock,
            windows: KeyedMap::new(),
        });
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = Arc::downgrade(&inner);
            let token = cancel.clone();
            let stale_limit = duration.saturating_mul(2);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(stale_limit.max(Duration::from_millis(100)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = sweep.upgrade() else { break };
                            let now = inner.clock.now();
                            let evicted = inner.windows.retain(|w| {
                                match w.hits.back() {
                                    Some(&newest) => now.duration_since(newest) <= stale_limit,
                                    None => false,
                                }
                            });
                            if evicted > 0 {
                                tracing::debug!(evicted, "evicted stale rate-limit windows");
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

impl Drop for SlidingWindowLimiter {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.cancel.cancel();
        }
    }
}

impl RateLimit for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> Decision {
        self.inner.decide(key, true)
    }

    fn check(&self, key: &str) -> Decision {
        self.inner.decide(key, false)
    }

    fn refund(&self, key: &str) {
        if let Some(entry) = self.inner.windows.get(key) {
            let mut window = entry.lock().unwrap_or_else(|e| e.into_inner());
            window.hits.pop_back();
        }
    }

    fn reset(&self, key: &str) {
        self.inner.windows.remove(key);
    }

    fn tracked_keys(&self) -> usize {
        self.inner.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, duration_ms: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(limit, Duration::from_millis(duration_ms)).unwrap()
    }

    #[test]
    fn admissions_count_down_remaining() {
        let limiter = limiter(3, 100);
        assert_eq!(limiter.allow("k").remaining, 2);
        assert_eq!(limiter.allow("k").remaining, 1);
        assert_eq!(limiter.allow("k").remaining, 0);
    }

    #[test]
    fn full_window_denies_with_retry_after() {
        let limiter = limiter(3, 100);
        for _ in 0..3 {
            assert!(limiter.allow("k").allowed);
        }
        let denied = limiter.allow("k");
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() >= Duration::from_secs(1));
    }

    #[test]
    fn window_slides_open_after_the_duration() {
        let limiter = limiter(3, 100);
        for _ in 0..3 {
            assert!(limiter.allow("k").allowed);
        }
        assert!(!limiter.allow("k").allowed);

        std::thread::sleep(Duration::from_millis(150));
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn pruned_window_never_exceeds_limit() {
        let limiter = limiter(2, 50);
        for _ in 0..10 {
            limiter.allow("k");
            std::thread::sleep(Duration::from_millis(5));
        }
        let entry = limiter.inner.windows.get("k").unwrap();
        let window = entry.lock().unwrap();
        assert!(window.hits.len() <= 2);
    }

    #[test]
    fn refund_pops_the_newest_admission() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.allow("k").allowed);
        assert!(!limiter.allow("k").allowed);
        limiter.refund("k");
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn reset_forgets_the_key() {
        let limiter = limiter(1, 60_000);
        assert!(limiter.allow("k").allowed);
        limiter.reset("k");
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.allow("k").allowed);
    }
}
