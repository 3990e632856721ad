//! Composes the gatehouse protection stack into one Tower layer.
//!
//! The pipeline is assembled bottom-up at configuration time, not per
//! request. From the outside in:
//!
//! 1. exemption router (listed paths skip every protection below),
//! 2. security headers and CORS (decorate every response, denials
//!    included),
//! 3. request bounds (size 413, content type 415, timeout 503),
//! 4. IP throttle (penalties, subnet budget, auto-block enforcement),
//! 5. keyed rate limit,
//! 6. CSRF validation,
//! 7. the wrapped handler.
//!
//! Components share one [`SecurityEventBus`]; the optional
//! [`SecurityMonitor`] aggregates suspicious events per client address and
//! feeds its block list back into the throttle, so repeated offenders are
//! rejected before they reach anything else.
//!
//! The [`InputValidator`](gatehouse_validation::InputValidator) is not a
//! layer (it needs parsed form values); the pipeline builds and shares it
//! through [`Pipeline::validator`] for handlers to apply.
//!
//! ```
//! use gatehouse_pipeline::Pipeline;
//! use gatehouse_events::MonitorConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::<String>::builder()
//!     .throttle(|t| t.requests_per_minute(300).suspicious_threshold(5))
//!     .ratelimit(|r| r.burst_size(50))
//!     .csrf(|c| c.exempt_globs(["/api/*"]))
//!     .headers(|h| h.hsts_max_age(31_536_000))
//!     .bounds(|b| b.max_body_bytes(1 << 20).timeout(std::time::Duration::from_secs(30)))
//!     .monitor(MonitorConfig::default())
//!     .exempt_paths(["/healthz"])
//!     .build()?;
//!
//! let service = pipeline.wrap(tower::service_fn(|_req: http::Request<String>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new("hello".to_string()))
//! }));
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

mod limits;

pub use limits::{BoundsConfig, BoundsConfigBuilder, BoundsLayer, BoundsService};

use futures::future::BoxFuture;
use gatehouse_core::ConfigError;
use gatehouse_csrf::{CsrfConfig, CsrfConfigBuilder, CsrfLayer};
use gatehouse_events::{ClientIp, MonitorConfig, SecurityEventBus, SecurityMonitor};
use gatehouse_headers::{HeadersConfig, HeadersConfigBuilder, SecurityHeadersLayer};
use gatehouse_ratelimit::{RateLimitConfig, RateLimitConfigBuilder, RateLimitLayer};
use gatehouse_throttle::{IpThrottler, ThrottleConfig, ThrottleConfigBuilder, ThrottleLayer};
use gatehouse_validation::{InputValidator, ValidatorConfigBuilder};
use http::{Request, Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

type Customize<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Builder for [`Pipeline`].
///
/// Each protection is off until its method is called; pass
/// `std::convert::identity` to enable one with defaults.
pub struct PipelineBuilder<B> {
    headers: Option<Customize<HeadersConfigBuilder>>,
    bounds: Option<Customize<BoundsConfigBuilder>>,
    throttle: Option<Customize<ThrottleConfigBuilder>>,
    ratelimit: Option<Customize<RateLimitConfigBuilder<B>>>,
    csrf: Option<Customize<CsrfConfigBuilder>>,
    validator: Option<Customize<ValidatorConfigBuilder>>,
    monitor: Option<MonitorConfig>,
    exempt_paths: Vec<String>,
    bus: Option<SecurityEventBus>,
}

impl<B> Default for PipelineBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> PipelineBuilder<B> {
    /// Creates a builder with every protection disabled.
    pub fn new() -> Self {
        Self {
            headers: None,
            bounds: None,
            throttle: None,
            ratelimit: None,
            csrf: None,
            validator: None,
            monitor: None,
            exempt_paths: Vec::new(),
            bus: None,
        }
    }

    /// Enables security headers, customized by `f`.
    pub fn headers<F>(mut self, f: F) -> Self
    where
        F: FnOnce(HeadersConfigBuilder) -> HeadersConfigBuilder + Send + 'static,
    {
        self.headers = Some(Box::new(f));
        self
    }

    /// Enables request bounds, customized by `f`.
    pub fn bounds<F>(mut self, f: F) -> Self
    where
        F: FnOnce(BoundsConfigBuilder) -> BoundsConfigBuilder + Send + 'static,
    {
        self.bounds = Some(Box::new(f));
        self
    }

    /// Enables IP throttling, customized by `f`. The pipeline's event bus
    /// and (when the monitor is on) block list are wired in automatically.
    pub fn throttle<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ThrottleConfigBuilder) -> ThrottleConfigBuilder + Send + 'static,
    {
        self.throttle = Some(Box::new(f));
        self
    }

    /// Enables keyed rate limiting, customized by `f`. Unless `f` installs
    /// its own key, requests are keyed by the resolved client address.
    pub fn ratelimit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RateLimitConfigBuilder<B>) -> RateLimitConfigBuilder<B> + Send + 'static,
    {
        self.ratelimit = Some(Box::new(f));
        self
    }

    /// Enables CSRF validation, customized by `f`.
    pub fn csrf<F>(mut self, f: F) -> Self
    where
        F: FnOnce(CsrfConfigBuilder) -> CsrfConfigBuilder + Send + 'static,
    {
        self.csrf = Some(Box::new(f));
        self
    }

    /// Builds an input validator sharing the pipeline's event bus,
    /// available through [`Pipeline::validator`].
    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ValidatorConfigBuilder) -> ValidatorConfigBuilder + Send + 'static,
    {
        self.validator = Some(Box::new(f));
        self
    }

    /// Enables the security monitor; offenders are auto-blocked at the
    /// throttle.
    pub fn monitor(mut self, config: MonitorConfig) -> Self {
        self.monitor = Some(config);
        self
    }

    /// Paths that bypass the whole protection stack (exact match).
    pub fn exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Shares an existing event bus instead of creating one.
    pub fn event_bus(mut self, bus: SecurityEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Builds the pipeline, constructing every enabled component.
    pub fn build(self) -> Result<Pipeline<B>, ConfigError>
    where
        B: 'static,
    {
        let bus = self.bus.unwrap_or_default();
        let monitor = self
            .monitor
            .map(|config| SecurityMonitor::install(config, &bus));

        let headers = self
            .headers
            .map(|f| f(HeadersConfig::builder()).build())
            .transpose()?
            .map(HeadersConfig::layer);

        let bounds = self
            .bounds
            .map(|f| f(BoundsConfig::builder()).build())
            .transpose()?
            .map(BoundsConfig::layer);

        let throttle = self
            .throttle
            .map(|f| {
                let mut builder = ThrottleConfig::builder().event_bus(bus.clone());
                if let Some(monitor) = &monitor {
                    builder = builder.blocklist(monitor.blocklist());
                }
                f(builder).build_layer()
            })
            .transpose()?;

        let ratelimit = self
            .ratelimit
            .map(|f| {
                let builder = RateLimitConfig::<B>::builder().key_fn(|req: &Request<B>| {
                    req.extensions()
                        .get::<ClientIp>()
                        .map(ClientIp::to_string)
                        .unwrap_or_else(|| "global".to_string())
                });
                f(builder).build()
            })
            .transpose()?
            .map(RateLimitConfig::layer);

        let csrf = self
            .csrf
            .map(|f| f(CsrfConfig::builder().event_bus(bus.clone())).build())
            .transpose()?
            .map(CsrfConfig::layer);

        let validator = self
            .validator
            .map(|f| {
                f(gatehouse_validation::ValidatorConfig::builder().event_bus(bus.clone())).build()
            })
            .transpose()?
            .map(Arc::new);

        Ok(Pipeline {
            headers,
            bounds,
            throttle,
            ratelimit,
            csrf,
            validator,
            monitor,
            bus,
            exempt_paths: Arc::new(self.exempt_paths),
        })
    }
}

/// The assembled protection stack.
pub struct Pipeline<B> {
    headers: Option<SecurityHeadersLayer>,
    bounds: Option<BoundsLayer>,
    throttle: Option<ThrottleLayer>,
    ratelimit: Option<RateLimitLayer<B>>,
    csrf: Option<CsrfLayer>,
    validator: Option<Arc<InputValidator>>,
    monitor: Option<SecurityMonitor>,
    bus: SecurityEventBus,
    exempt_paths: Arc<Vec<String>>,
}

impl<B> Pipeline<B> {
    /// Creates a new builder.
    pub fn builder() -> PipelineBuilder<B> {
        PipelineBuilder::new()
    }

    /// The shared security event bus.
    pub fn bus(&self) -> SecurityEventBus {
        self.bus.clone()
    }

    /// The security monitor, when enabled.
    pub fn monitor(&self) -> Option<&SecurityMonitor> {
        self.monitor.as_ref()
    }

    /// The throttling engine, when enabled, for manual block/unblock and
    /// statistics.
    pub fn throttle_engine(&self) -> Option<IpThrottler> {
        self.throttle.as_ref().map(ThrottleLayer::engine)
    }

    /// The shared input validator, when enabled.
    pub fn validator(&self) -> Option<Arc<InputValidator>> {
        self.validator.clone()
    }

    /// Wraps `service` with every enabled protection.
    pub fn wrap<S, ResBody>(&self, service: S) -> Protected<B, ResBody, S::Error>
    where
        S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Send + 'static,
        B: Send + 'static,
        ResBody: From<String> + Send + 'static,
    {
        let raw = BoxCloneService::new(service.clone());
        let mut protected = BoxCloneService::new(service);

        if let Some(csrf) = &self.csrf {
            protected = BoxCloneService::new(csrf.layer(protected));
        }
        if let Some(ratelimit) = &self.ratelimit {
            protected = BoxCloneService::new(ratelimit.layer(protected));
        }
        if let Some(throttle) = &self.throttle {
            protected = BoxCloneService::new(throttle.layer(protected));
        }
        if let Some(bounds) = &self.bounds {
            protected = BoxCloneService::new(bounds.layer(protected));
        }
        if let Some(headers) = &self.headers {
            protected = BoxCloneService::new(headers.layer(protected));
        }

        Protected {
            raw,
            protected,
            exempt_paths: Arc::clone(&self.exempt_paths),
        }
    }
}

impl<S, B, ResBody> Layer<S> for Pipeline<B>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Service = Protected<B, ResBody, S::Error>;

    fn layer(&self, service: S) -> Self::Service {
        self.wrap(service)
    }
}

/// A service protected by the pipeline. Exempt paths route around the
/// protection stack straight to the wrapped handler.
pub struct Protected<B, ResBody, E> {
    raw: BoxCloneService<Request<B>, Response<ResBody>, E>,
    protected: BoxCloneService<Request<B>, Response<ResBody>, E>,
    exempt_paths: Arc<Vec<String>>,
}

impl<B, ResBody, E> Clone for Protected<B, ResBody, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            protected: self.protected.clone(),
            exempt_paths: Arc::clone(&self.exempt_paths),
        }
    }
}

impl<B, ResBody, E> Service<Request<B>> for Protected<B, ResBody, E>
where
    B: Send + 'static,
    ResBody: Send + 'static,
    E: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = E;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let exempt = self.exempt_paths.iter().any(|p| p == req.uri().path());
        let service = if exempt {
            self.raw.clone()
        } else {
            self.protected.clone()
        };
        Box::pin(service.oneshot(req))
    }
}
