use crate::{RateLimitConfig, RateLimitService};
use std::sync::Arc;
use tower::Layer;

/// A Tower [`Layer`] that applies keyed rate limiting to an HTTP service.
///
/// Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining`, and
/// `X-RateLimit-Reset`; denied requests short-circuit with 429, a
/// `Retry-After` header, and a structured JSON body.
///
/// # Examples
///
/// ```
/// use gatehouse_ratelimit::{LimiterKind, RateLimitConfig};
/// use tower::ServiceBuilder;
/// use std::time::Duration;
///
/// # async fn example() {
/// let layer = RateLimitConfig::builder()
///     .kind(LimiterKind::TokenBucket)
///     .requests_per_minute(120)
///     .burst_size(20)
///     .key_fn(|req: &http::Request<String>| {
///         req.headers()
///             .get("x-api-key")
///             .and_then(|v| v.to_str().ok())
///             .map(|k| format!("api:{k}"))
///             .unwrap_or_else(|| "global".to_string())
///     })
///     .build()
///     .unwrap()
///     .layer();
///
/// let service = ServiceBuilder::new().layer(layer).service(my_service());
/// # }
/// # fn my_service() -> impl tower::Service<http::Request<String>, Response = http::Response<String>, Error = std::convert::Infallible> {
/// #     tower::service_fn(|_req: http::Request<String>| async move {
/// #         Ok::<_, std::convert::Infallible>(http::Response::new(String::new()))
/// #     })
/// # }
/// ```
pub struct RateLimitLayer<B> {
    config: Arc<RateLimitConfig<B>>,
}

impl<B> Clone for RateLimitLayer<B> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
        }
    }
}

impl<B> RateLimitLayer<B> {
    /// Creates a new `RateLimitLayer` with the given configuration.
    pub fn new(config: RateLimitConfig<B>) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<B> RateLimitConfig<B> {
    /// Wraps this configuration in a [`RateLimitLayer`].
    pub fn layer(self) -> RateLimitLayer<B> {
        RateLimitLayer::new(self)
    }
}

impl<S, B> Layer<S> for RateLimitLayer<B> {
    type Service = RateLimitService<S, B>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService::new(service, Arc::clone(&self.config))
    }
}
