//! Per-IP throttling middleware with progressive penalties.
//!
//! Each inbound request is attributed to a client address (resolved through
//! the trusted-proxy rules in [`realip`]) and admitted against:
//!
//! 1. a static blacklist (always denied) and whitelist (always allowed),
//! 2. the security monitor's shared [`BlockList`](gatehouse_events::BlockList),
//! 3. any penalty or temporary blacklist the address has earned,
//! 4. an optional shared per-subnet budget,
//! 5. a per-IP token bucket whose refill rate degrades as the address's
//!    failure ratio climbs.
//!
//! Failed responses (status >= 400) feed back into the record: every ten
//! failures earn a minute of penalty (capped), and a burst of failures
//! within five minutes escalates to a longer penalty and eventually a
//! temporary blacklist.
//!
//! Throttled requests are answered `429` with a plain-text
//! `Request throttled: <reason>` body; statically blacklisted or
//! auto-blocked addresses get `403` and are not counted again.

mod config;
mod layer;
pub mod realip;
mod stats;

pub use config::{ThrottleConfig, ThrottleConfigBuilder};
pub use layer::ThrottleLayer;
pub use realip::{ClientIp, PeerAddr, RealIpResolver};
pub use stats::{DenyReason, IpSnapshot, IpThrottler, ThrottleDecision};

use futures::future::BoxFuture;
use gatehouse_events::{SecurityAction, SecurityEvent, SecurityEventKind, Severity};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Request, Response, StatusCode};
use std::net::IpAddr;
use std::task::{Context, Poll};
use tower::Service;

#[cfg(feature = "metrics")]
use metrics::counter;

/// A Tower [`Service`] applying per-IP throttling to HTTP requests.
pub struct ThrottleService<S> {
    inner: S,
    throttler: IpThrottler,
}

impl<S> ThrottleService<S> {
    /// Creates a new service wrapping `inner`.
    pub fn new(inner: S, throttler: IpThrottler) -> Self {
        Self { inner, throttler }
    }

    fn client_ip<B>(&self, req: &Request<B>) -> Option<IpAddr> {
        if let Some(ClientIp(ip)) = req.extensions().get::<ClientIp>() {
            return Some(*ip);
        }
        let PeerAddr(peer) = req.extensions().get::<PeerAddr>()?;
        Some(self.throttler.config().resolver.resolve(req, peer.ip()))
    }
}

impl<S: Clone> Clone for ThrottleService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            throttler: self.throttler.clone(),
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ThrottleService<S>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let throttler = self.throttler.clone();
        let ip = self.client_ip(&req);

        Box::pin(async move {
            let Some(ip) = ip else {
                // No transport peer recorded; nothing to attribute.
                tracing::trace!("request carries no peer address, skipping throttle");
                return inner.call(req).await;
            };

            match throttler.check(ip) {
                ThrottleDecision::Allowed => {
                    req.extensions_mut().insert(ClientIp(ip));
                    let response = inner.call(req).await?;
                    if response.status().as_u16() >= 400 {
                        throttler.record_failure(ip);
                    }
                    Ok(response)
                }
                ThrottleDecision::Denied {
                    reason,
                    retry_after,
                } => {
                    tracing::debug!(
                        ip = %ip,
                        reason = reason.as_str(),
                        "request throttled"
                    );

                    #[cfg(feature = "metrics")]
                    counter!(
                        "gatehouse_throttle_denied_total",
                        "reason" => reason.as_str()
                    )
                    .increment(1);

                    if !reason.is_forbidden() {
                        if let Some(bus) = &throttler.config().bus {
                            bus.emit(
                                SecurityEvent::new(
                                    SecurityEventKind::RateLimitExceeded,
                                    Severity::Medium,
                                    SecurityAction::Blocked,
                                    format!("Request throttled: {}", reason.as_str()),
                                )
                                .with_client_ip(ip.to_string())
                                .with_request(
                                    req.method().to_string(),
                                    req.uri().to_string(),
                                    req.headers()
                                        .get(http::header::USER_AGENT)
                                        .and_then(|v| v.to_str().ok())
                                        .unwrap_or_default()
                                        .to_string(),
                                ),
                            );
                        }
                    }

                    let status = if reason.is_forbidden() {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::TOO_MANY_REQUESTS
                    };
                    let body = format!("Request throttled: {}", reason.as_str());
                    let mut response = Response::new(ResBody::from(body));
                    *response.status_mut() = status;
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    response.headers_mut().insert(
                        "x-ratelimit-limit",
                        HeaderValue::from(throttler.config().requests_per_minute),
                    );
                    response
                        .headers_mut()
                        .insert("x-ratelimit-remaining", HeaderValue::from(0u32));
                    if let Some(retry_after) = retry_after {
                        let reset = (std::time::SystemTime::now() + retry_after)
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        response
                            .headers_mut()
                            .insert("x-ratelimit-reset", HeaderValue::from(reset));
                        response.headers_mut().insert(
                            RETRY_AFTER,
                            HeaderValue::from(retry_after.as_secs().max(1)),
                        );
                    }
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::{service_fn, Layer, ServiceExt};

    fn service_with_status(
        status: StatusCode,
    ) -> tower::util::BoxCloneService<Request<String>, Response<String>, std::convert::Infallible>
    {
        tower::util::BoxCloneService::new(service_fn(move |_req: Request<String>| async move {
            let mut response = Response::new("done".to_string());
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    }

    fn request(peer: &str) -> Request<String> {
        let mut req = Request::builder()
            .uri("/")
            .body(String::new())
            .unwrap();
        let addr: SocketAddr = format!("{peer}:44123").parse().unwrap();
        req.extensions_mut().insert(PeerAddr(addr));
        req
    }

    #[tokio::test]
    async fn allowed_requests_reach_the_inner_service() {
        let layer = ThrottleConfig::builder().build_layer().unwrap();
        let mut service = layer.layer(service_with_status(StatusCode::OK));

        let response = service
            .ready()
            .await
            .unwrap()
            .call(request("203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exhausted_burst_returns_429_with_reason() {
        let layer = ThrottleConfig::builder()
            .requests_per_minute(60)
            .burst_size(2)
            .build_layer()
            .unwrap();
        let mut service = layer.layer(service_with_status(StatusCode::OK));

        for _ in 0..2 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("203.0.113.2"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let denied = service
            .ready()
            .await
            .unwrap()
            .call(request("203.0.113.2"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.body(), "Request throttled: Rate limit exceeded");
        assert!(denied.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn blacklisted_ips_get_403() {
        let layer = ThrottleConfig::builder()
            .blacklist(["203.0.113.0/24"])
            .build_layer()
            .unwrap();
        let mut service = layer.layer(service_with_status(StatusCode::OK));

        let denied = service
            .ready()
            .await
            .unwrap()
            .call(request("203.0.113.3"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        assert_eq!(denied.body(), "Request throttled: IP blacklisted");
    }

    #[tokio::test]
    async fn failing_responses_earn_a_penalty() {
        let layer = ThrottleConfig::builder()
            .suspicious_threshold(3)
            .suspicious_penalty_minutes(5)
            .build_layer()
            .unwrap();
        let mut service = layer.layer(service_with_status(StatusCode::INTERNAL_SERVER_ERROR));

        // Three 500s from the same address within the burst window.
        for _ in 0..3 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("203.0.113.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        let denied = service
            .ready()
            .await
            .unwrap()
            .call(request("203.0.113.4"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.body(), "Request throttled: IP under penalty");
    }

    #[tokio::test]
    async fn resolved_client_ip_is_available_downstream() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen_clone = std::sync::Arc::clone(&seen);
        let inner = service_fn(move |req: Request<String>| {
            let seen = std::sync::Arc::clone(&seen_clone);
            async move {
                *seen.lock().unwrap() = req.extensions().get::<ClientIp>().copied();
                Ok::<_, std::convert::Infallible>(Response::new(String::new()))
            }
        });

        let layer = ThrottleConfig::builder()
            .trusted_proxies(["10.0.0.5"])
            .build_layer()
            .unwrap();
        let mut service = layer.layer(inner);

        let mut req = request("10.0.0.5");
        req.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.9"),
        );
        service.ready().await.unwrap().call(req).await.unwrap();

        assert_eq!(
            seen.lock().unwrap().unwrap(),
            ClientIp("198.51.100.9".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn throttle_denials_emit_security_events() {
        let bus = gatehouse_events::SecurityEventBus::new();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_clone = std::sync::Arc::clone(&events);
        bus.subscribe_fn(move |event| {
            events_clone.lock().unwrap().push(event.kind);
        });

        let layer = ThrottleConfig::builder()
            .burst_size(1)
            .event_bus(bus)
            .build_layer()
            .unwrap();
        let mut service = layer.layer(service_with_status(StatusCode::OK));

        for _ in 0..2 {
            let _ = service
                .ready()
                .await
                .unwrap()
                .call(request("203.0.113.5"))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = events.lock().unwrap();
        assert_eq!(seen.as_slice(), &[SecurityEventKind::RateLimitExceeded]);
    }
}
