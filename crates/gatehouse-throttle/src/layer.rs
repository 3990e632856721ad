use crate::{IpThrottler, ThrottleConfig, ThrottleService};
use tower::Layer;

/// A Tower [`Layer`] that applies per-IP throttling to an HTTP service.
///
/// The layer owns one throttling engine; every service it wraps shares the
/// same per-IP accounting.
///
/// # Examples
///
/// ```
/// use gatehouse_throttle::ThrottleConfig;
/// use tower::ServiceBuilder;
///
/// # async fn example() {
/// let layer = ThrottleConfig::builder()
///     .requests_per_minute(120)
///     .burst_size(20)
///     .trusted_proxies(["10.0.0.0/8"])
///     .suspicious_threshold(5)
///     .build_layer()
///     .unwrap();
///
/// let service = ServiceBuilder::new().layer(layer).service(my_service());
/// # }
/// # fn my_service() -> impl tower::Service<http::Request<String>, Response = http::Response<String>, Error = std::convert::Infallible> {
/// #     tower::service_fn(|_req: http::Request<String>| async move {
/// #         Ok::<_, std::convert::Infallible>(http::Response::new(String::new()))
/// #     })
/// # }
/// ```
#[derive(Clone)]
pub struct ThrottleLayer {
    throttler: IpThrottler,
}

impl ThrottleLayer {
    /// Creates a new `ThrottleLayer` with the given configuration.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            throttler: IpThrottler::new(config),
        }
    }

    /// Wraps an existing engine, sharing its accounting with other callers.
    pub fn from_engine(throttler: IpThrottler) -> Self {
        Self { throttler }
    }

    /// The engine behind this layer, for manual block/unblock and stats.
    pub fn engine(&self) -> IpThrottler {
        self.throttler.clone()
    }
}

impl crate::config::ThrottleConfigBuilder {
    /// Builds the configuration and wraps it in a [`ThrottleLayer`].
    pub fn build_layer(self) -> Result<ThrottleLayer, gatehouse_core::ConfigError> {
        Ok(ThrottleLayer::new(self.build()?))
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService::new(service, self.throttler.clone())
    }
}
