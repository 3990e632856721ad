//! The decision contract shared by both limiter engines.

use std::time::Duration;

/// Outcome of an admission attempt for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The configured limit for the period.
    pub limit: u32,
    /// Admissions left in the current period after this decision.
    pub remaining: u32,
    /// How long the caller should wait before retrying. Present only on
    /// denial; never below one second.
    pub retry_after: Option<Duration>,
    /// Time until the key's budget resets.
    pub reset_after: Duration,
}

impl Decision {
    /// An allowed decision.
    pub(crate) fn allowed(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: None,
            reset_after,
        }
    }

    /// A denied decision. `retry_after` is clamped up to one second.
    pub(crate) fn denied(limit: u32, retry_after: Duration, reset_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after: Some(retry_after.max(Duration::from_secs(1))),
            reset_after,
        }
    }
}

/// Common capability implemented by the token-bucket and sliding-window
/// engines. Callers select an engine by configuration and program against
/// this trait.
pub trait RateLimit: Send + Sync + 'static {
    /// Attempts to admit one request for `key`, consuming budget on success.
    fn allow(&self, key: &str) -> Decision;

    /// Reports the decision `allow` would make without consuming budget.
    fn check(&self, key: &str) -> Decision;

    /// Returns one admission to `key`'s budget.
    ///
    /// Used by middleware configured to count only failed responses: the
    /// admission consumed up front is refunded once the response turns out
    /// to be successful.
    fn refund(&self, key: &str);

    /// Forgets all state for `key`. The next `allow` sees a fresh budget.
    fn reset(&self, key: &str);

    /// Number of keys currently tracked.
    fn tracked_keys(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_clamps_retry_after_to_one_second() {
        let d = Decision::denied(10, Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(d.retry_after, Some(Duration::from_secs(1)));

        let d = Decision::denied(10, Duration::from_secs(3), Duration::from_secs(3));
        assert_eq!(d.retry_after, Some(Duration::from_secs(3)));
    }
}
