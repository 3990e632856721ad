//! Configuration for the rate-limit middleware.

use crate::bucket::TokenBucketLimiter;
use crate::decision::RateLimit;
use crate::events::RateLimitEvent;
use crate::window::SlidingWindowLimiter;
use gatehouse_core::{ConfigError, EventListeners, FnListener};
use http::Request;
use std::sync::Arc;
use std::time::Duration;

/// Which limiter engine backs the middleware.
///
/// Both engines expose the same decision contract; callers pick by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    /// Refillable per-key token bucket (bursts up to `burst_size`).
    TokenBucket,
    /// Ordered per-key admission timestamps within a rolling window.
    SlidingWindow,
}

/// Extracts the limit key from a request.
pub type KeyFn<B> = Arc<dyn Fn(&Request<B>) -> String + Send + Sync>;

/// Configuration for the rate-limit middleware.
pub struct RateLimitConfig<B> {
    pub(crate) limiter: Arc<dyn RateLimit>,
    pub(crate) key_fn: KeyFn<B>,
    pub(crate) skip_successful: bool,
    pub(crate) skip_paths: Vec<String>,
    pub(crate) event_listeners: EventListeners<RateLimitEvent>,
    pub(crate) name: String,
}

impl<B> std::fmt::Debug for RateLimitConfig<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("skip_successful", &self.skip_successful)
            .field("skip_paths", &self.skip_paths)
            .field("name", &self.name)
            .finish()
    }
}

impl<B> RateLimitConfig<B> {
    /// Creates a new builder for configuring the middleware.
    pub fn builder() -> RateLimitConfigBuilder<B> {
        RateLimitConfigBuilder::new()
    }

    /// The limiter engine behind this configuration, for direct
    /// `allow`/`check`/`reset` access outside the middleware.
    pub fn limiter(&self) -> Arc<dyn RateLimit> {
        Arc::clone(&self.limiter)
    }
}

/// Builder for [`RateLimitConfig`].
pub struct RateLimitConfigBuilder<B> {
    kind: LimiterKind,
    requests_per_minute: u32,
    burst_size: Option<u32>,
    window_size: Duration,
    skip_successful: bool,
    skip_paths: Vec<String>,
    key_fn: Option<KeyFn<B>>,
    limiter: Option<Arc<dyn RateLimit>>,
    event_listeners: EventListeners<RateLimitEvent>,
    name: String,
}

impl<B> Default for RateLimitConfigBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> RateLimitConfigBuilder<B> {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - kind: token bucket
    /// - requests_per_minute: 60
    /// - burst_size: same as requests_per_minute
    /// - window_size: 1 minute
    /// - skip_successful: false
    /// - key: the whole service shares one key
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        Self {
            kind: LimiterKind::TokenBucket,
            requests_per_minute: 60,
            burst_size: None,
            window_size: Duration::from_secs(60),
            skip_successful: false,
            skip_paths: Vec::new(),
            key_fn: None,
            limiter: None,
            event_listeners: EventListeners::new(),
            name: "<unnamed>".to_string(),
        }
    }

    /// Selects the limiter engine.
    pub fn kind(mut self, kind: LimiterKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the sustained admission rate.
    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Sets the burst capacity (token bucket) or window limit (sliding
    /// window). Defaults to `requests_per_minute`.
    pub fn burst_size(mut self, burst: u32) -> Self {
        self.burst_size = Some(burst);
        self
    }

    /// Sets the refill interval (token bucket) or rolling duration (sliding
    /// window).
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    /// When set, only failed responses (4xx/5xx) consume budget; the
    /// admission is refunded once the inner service answers below 400.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    /// Paths that bypass rate limiting entirely (exact match).
    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the limit-key extractor. Typical keys are the resolved client
    /// address, `user:<id>`, or `api:<key>`.
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request<B>) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Supplies a pre-built limiter engine, overriding `kind`/rate fields.
    pub fn limiter(mut self, limiter: Arc<dyn RateLimit>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Sets the name for this instance (used in events).
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a callback invoked when a request is admitted.
    pub fn on_allowed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RateLimitEvent::Allowed { key, remaining, .. } = event {
                f(key, *remaining);
            }
        }));
        self
    }

    /// Registers a callback invoked when a request is denied.
    pub fn on_denied<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RateLimitEvent::Denied {
                key, retry_after, ..
            } = event
            {
                f(key, *retry_after);
            }
        }));
        self
    }

    /// Builds the configuration, constructing the selected engine.
    ///
    /// Fails if a rate, burst, or window value is non-positive.
    pub fn build(self) -> Result<RateLimitConfig<B>, ConfigError> {
        let burst = self.burst_size.unwrap_or(self.requests_per_minute);
        let limiter: Arc<dyn RateLimit> = match self.limiter {
            Some(limiter) => limiter,
            None => match self.kind {
                LimiterKind::TokenBucket => Arc::new(TokenBucketLimiter::new(
                    self.requests_per_minute,
                    burst,
                    self.window_size,
                )?),
                LimiterKind::SlidingWindow => {
                    Arc::new(SlidingWindowLimiter::new(burst, self.window_size)?)
                }
            },
        };

        Ok(RateLimitConfig {
            limiter,
            key_fn: self
                .key_fn
                .unwrap_or_else(|| Arc::new(|_req: &Request<B>| "global".to_string())),
            skip_successful: self.skip_successful,
            skip_paths: self.skip_paths,
            event_listeners: self.event_listeners,
            name: self.name,
        })
    }
}
