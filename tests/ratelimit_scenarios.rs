//! End-to-end rate limiter scenarios against the public limiter APIs.

use gatehouse_ratelimit::{RateLimit, SlidingWindowLimiter, TokenBucketLimiter};
use std::time::Duration;

#[tokio::test]
async fn token_bucket_burst_of_five_then_denied() {
    // rate=5, capacity=5, interval=100ms: six back-to-back calls.
    let limiter = TokenBucketLimiter::new(5, 5, Duration::from_millis(100)).unwrap();

    for i in 0..5 {
        let decision = limiter.allow("k");
        assert!(decision.allowed, "call {i} should be admitted");
    }

    let denied = limiter.allow("k");
    assert!(!denied.allowed);
    assert!(denied.retry_after.unwrap() >= Duration::from_secs(1));
}

#[tokio::test]
async fn sliding_window_remaining_counts_down() {
    // limit=3, duration=100ms: four back-to-back calls.
    let limiter = SlidingWindowLimiter::new(3, Duration::from_millis(100)).unwrap();

    let first = limiter.allow("k");
    assert!(first.allowed);
    assert_eq!(first.remaining, 2);

    let second = limiter.allow("k");
    assert!(second.allowed);
    assert_eq!(second.remaining, 1);

    let third = limiter.allow("k");
    assert!(third.allowed);
    assert_eq!(third.remaining, 0);

    let fourth = limiter.allow("k");
    assert!(!fourth.allowed);
    assert!(fourth.retry_after.unwrap() >= Duration::from_secs(1));
}

#[tokio::test]
async fn burst_of_one_recovers_after_a_second() {
    // BurstSize=1, RequestsPerMinute=60: one token per second.
    let limiter = TokenBucketLimiter::new(1, 1, Duration::from_secs(1)).unwrap();

    assert!(limiter.allow("k").allowed);
    assert!(!limiter.allow("k").allowed);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(limiter.allow("k").allowed);
}

#[tokio::test]
async fn window_reopens_after_the_duration() {
    let limiter = SlidingWindowLimiter::new(3, Duration::from_millis(100)).unwrap();

    assert!(limiter.allow("k").allowed);
    assert!(limiter.allow("k").allowed);
    assert!(limiter.allow("k").allowed);
    assert!(!limiter.allow("k").allowed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(limiter.allow("k").allowed);
}

#[tokio::test]
async fn reset_then_allow_sees_a_fresh_bucket() {
    let limiter = TokenBucketLimiter::new(60, 10, Duration::from_secs(60)).unwrap();

    for _ in 0..10 {
        limiter.allow("k");
    }
    limiter.reset("k");

    let decision = limiter.allow("k");
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 9);
}
