//! Events emitted by the rate-limit middleware.

use gatehouse_core::GatehouseEvent;
use std::time::{Duration, Instant};

/// Events emitted by the rate-limit middleware.
#[derive(Debug, Clone)]
pub enum RateLimitEvent {
    /// A request was admitted.
    Allowed {
        component: String,
        timestamp: Instant,
        key: String,
        remaining: u32,
    },
    /// A request was denied.
    Denied {
        component: String,
        timestamp: Instant,
        key: String,
        retry_after: Duration,
    },
}

impl GatehouseEvent for RateLimitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RateLimitEvent::Allowed { .. } => "Allowed",
            RateLimitEvent::Denied { .. } => "Denied",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            RateLimitEvent::Allowed { timestamp, .. }
            | RateLimitEvent::Denied { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            RateLimitEvent::Allowed { component, .. }
            | RateLimitEvent::Denied { component, .. } => component,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_are_stable() {
        let now = Instant::now();
        let allowed = RateLimitEvent::Allowed {
            component: "test".to_string(),
            timestamp: now,
            key: "k".to_string(),
            remaining: 4,
        };
        assert_eq!(allowed.event_type(), "Allowed");
        assert_eq!(allowed.component(), "test");

        let denied = RateLimitEvent::Denied {
            component: "test".to_string(),
            timestamp: now,
            key: "k".to_string(),
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(denied.event_type(), "Denied");
    }
}
