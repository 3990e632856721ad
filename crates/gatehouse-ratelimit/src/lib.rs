//! Keyed rate limiting middleware for Tower HTTP services.
//!
//! Two engines with one contract:
//!
//! - **Token bucket**: per-key refillable budget. Allows bursts up to
//!   `burst_size`, refills at `requests_per_minute`.
//! - **Sliding window**: per-key ordered admission timestamps inside a
//!   rolling duration. No burst beyond the window limit.
//!
//! Both implement [`RateLimit`], so callers select an engine by
//! configuration and the middleware is engine-agnostic. Per-key state is
//! created lazily and evicted by a background sweep once idle.
//!
//! # HTTP contract
//!
//! Every response passing through the middleware carries
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining`, and `X-RateLimit-Reset`
//! (unix seconds). A denied request is answered directly with `429`, a
//! `Retry-After` header, and the JSON body
//! `{"code":"RATE_LIMIT_EXCEEDED","limit":..,"retry_after":..,"reset":..}`.
//!
//! # Examples
//!
//! ```
//! use gatehouse_ratelimit::{LimiterKind, RateLimitConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let layer = RateLimitConfig::<String>::builder()
//!     .kind(LimiterKind::SlidingWindow)
//!     .burst_size(100)
//!     .window_size(Duration::from_secs(60))
//!     .skip_paths(["/healthz"])
//!     .on_denied(|key, retry_after| {
//!         eprintln!("rate limited {key}, retry in {retry_after:?}");
//!     })
//!     .build()
//!     .unwrap()
//!     .layer();
//! # let _ = layer;
//! # }
//! ```

mod bucket;
mod config;
mod decision;
mod events;
mod keyed;
mod layer;
mod window;

pub use bucket::TokenBucketLimiter;
pub use config::{KeyFn, LimiterKind, RateLimitConfig, RateLimitConfigBuilder};
pub use decision::{Decision, RateLimit};
pub use events::RateLimitEvent;
pub use layer::RateLimitLayer;
pub use window::SlidingWindowLimiter;

use futures::future::BoxFuture;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tower::Service;

#[cfg(feature = "metrics")]
use metrics::counter;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

fn unix_seconds_after(delay: Duration) -> u64 {
    (SystemTime::now() + delay)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn apply_limit_headers<B>(response: &mut Response<B>, limit: u32, remaining: u32, reset: u64) {
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset));
}

/// A Tower [`Service`] applying keyed rate limiting to HTTP requests.
pub struct RateLimitService<S, B> {
    inner: S,
    config: Arc<RateLimitConfig<B>>,
}

impl<S, B> RateLimitService<S, B> {
    /// Creates a new service wrapping `inner`.
    pub fn new(inner: S, config: Arc<RateLimitConfig<B>>) -> Self {
        Self { inner, config }
    }
}

impl<S: Clone, B> Clone for RateLimitService<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, ReqBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            if config
                .skip_paths
                .iter()
                .any(|p| p == req.uri().path())
            {
                return inner.call(req).await;
            }

            let key = (config.key_fn)(&req);
            let decision = config.limiter.allow(&key);
            let reset = unix_seconds_after(decision.reset_after);

            if !decision.allowed {
                let retry_after = decision
                    .retry_after
                    .unwrap_or_else(|| Duration::from_secs(1));

                tracing::debug!(
                    limiter = %config.name,
                    key = %key,
                    retry_after_secs = retry_after.as_secs(),
                    "rate limit exceeded"
                );

                #[cfg(feature = "metrics")]
                counter!("gatehouse_ratelimit_denied_total", "limiter" => config.name.clone())
                    .increment(1);

                config.event_listeners.emit(&RateLimitEvent::Denied {
                    component: config.name.clone(),
                    timestamp: Instant::now(),
                    key: key.clone(),
                    retry_after,
                });

                let body = serde_json::json!({
                    "code": "RATE_LIMIT_EXCEEDED",
                    "limit": decision.limit,
                    "retry_after": retry_after.as_secs(),
                    "reset": reset,
                })
                .to_string();

                let mut response = Response::new(ResBody::from(body));
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
                apply_limit_headers(&mut response, decision.limit, 0, reset);
                return Ok(response);
            }

            #[cfg(feature = "metrics")]
            counter!("gatehouse_ratelimit_allowed_total", "limiter" => config.name.clone())
                .increment(1);

            config.event_listeners.emit(&RateLimitEvent::Allowed {
                component: config.name.clone(),
                timestamp: Instant::now(),
                key: key.clone(),
                remaining: decision.remaining,
            });

            let mut response = inner.call(req).await?;
            if config.skip_successful && response.status().as_u16() < 400 {
                config.limiter.refund(&key);
            }
            apply_limit_headers(&mut response, decision.limit, decision.remaining, reset);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, Layer, ServiceExt};

    fn ok_service(
    ) -> tower::util::BoxCloneService<Request<String>, Response<String>, std::convert::Infallible>
    {
        tower::util::BoxCloneService::new(service_fn(|_req: Request<String>| async move {
            Ok::<_, std::convert::Infallible>(Response::new("ok".to_string()))
        }))
    }

    fn request(path: &str) -> Request<String> {
        Request::builder()
            .uri(path)
            .body(String::new())
            .unwrap()
    }

    #[tokio::test]
    async fn allowed_responses_carry_limit_headers() {
        let layer = RateLimitConfig::builder()
            .requests_per_minute(5)
            .burst_size(5)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(request("/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "5");
        assert_eq!(response.headers()[REMAINING_HEADER], "4");
        assert!(response.headers().contains_key(RESET_HEADER));
    }

    #[tokio::test]
    async fn exhausted_budget_returns_429_with_json_body() {
        let layer = RateLimitConfig::builder()
            .requests_per_minute(60)
            .burst_size(1)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        let first = service
            .ready()
            .await
            .unwrap()
            .call(request("/"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = service
            .ready()
            .await
            .unwrap()
            .call(request("/"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()[CONTENT_TYPE], "application/json");
        assert!(denied.headers().contains_key(RETRY_AFTER));

        let body: serde_json::Value = serde_json::from_str(denied.body()).unwrap();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["limit"], 1);
    }

    #[tokio::test]
    async fn skip_paths_bypass_limiting() {
        let layer = RateLimitConfig::builder()
            .requests_per_minute(60)
            .burst_size(1)
            .skip_paths(["/healthz"])
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        for _ in 0..5 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("/healthz"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn skip_successful_refunds_ok_responses() {
        let layer = RateLimitConfig::builder()
            .requests_per_minute(60)
            .burst_size(1)
            .skip_successful(true)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        // Every response is 200, so the budget of one is never consumed.
        for _ in 0..5 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("/"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn keys_are_limited_independently() {
        let layer = RateLimitConfig::builder()
            .requests_per_minute(60)
            .burst_size(1)
            .key_fn(|req: &Request<String>| req.uri().path().to_string())
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        let a1 = service
            .ready()
            .await
            .unwrap()
            .call(request("/a"))
            .await
            .unwrap();
        let a2 = service
            .ready()
            .await
            .unwrap()
            .call(request("/a"))
            .await
            .unwrap();
        let b1 = service
            .ready()
            .await
            .unwrap()
            .call(request("/b"))
            .await
            .unwrap();

        assert_eq!(a1.status(), StatusCode::OK);
        assert_eq!(a2.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(b1.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn denied_events_fire() {
        let denials = Arc::new(AtomicUsize::new(0));
        let denials_clone = Arc::clone(&denials);

        let layer = RateLimitConfig::builder()
            .requests_per_minute(60)
            .burst_size(1)
            .on_denied(move |_key, _retry| {
                denials_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        for _ in 0..3 {
            let _ = service
                .ready()
                .await
                .unwrap()
                .call(request("/"))
                .await
                .unwrap();
        }
        assert_eq!(denials.load(Ordering::SeqCst), 2);
    }
}
