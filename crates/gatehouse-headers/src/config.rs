//! Configuration for the security-header emitter.

use gatehouse_core::ConfigError;
use http::Method;

/// Configuration for the security-header emitter and CORS negotiation.
#[derive(Debug, Clone)]
pub struct HeadersConfig {
    pub(crate) content_security_policy: Option<String>,
    pub(crate) hsts_max_age: u64,
    pub(crate) hsts_include_subdomains: bool,
    pub(crate) hsts_preload: bool,
    pub(crate) frame_options: Option<String>,
    pub(crate) content_type_nosniff: bool,
    pub(crate) xss_protection: bool,
    pub(crate) xss_protection_mode: Option<String>,
    pub(crate) referrer_policy: Option<String>,
    pub(crate) permissions_policy: Option<String>,
    pub(crate) allowed_origins: Vec<String>,
    pub(crate) allowed_methods: Vec<Method>,
    pub(crate) allowed_headers: Vec<String>,
    pub(crate) allow_credentials: bool,
    pub(crate) cors_max_age: u64,
    pub(crate) custom_headers: Vec<(String, String)>,
}

impl HeadersConfig {
    /// Creates a new builder for configuring the emitter.
    pub fn builder() -> HeadersConfigBuilder {
        HeadersConfigBuilder::new()
    }

    /// The `Strict-Transport-Security` value, or `None` when disabled.
    pub(crate) fn hsts_value(&self) -> Option<String> {
        if self.hsts_max_age == 0 {
            return None;
        }
        let mut value = format!("max-age={}", self.hsts_max_age);
        if self.hsts_include_subdomains {
            value.push_str("; includeSubDomains");
        }
        if self.hsts_preload {
            value.push_str("; preload");
        }
        Some(value)
    }

    /// Matches `origin` against the allow list: exact, `*`, or `*.suffix`.
    /// Returns the `Access-Control-Allow-Origin` value to emit.
    pub(crate) fn match_origin(&self, origin: &str) -> Option<String> {
        for allowed in &self.allowed_origins {
            if allowed == "*" {
                return Some("*".to_string());
            }
            if allowed == origin {
                return Some(origin.to_string());
            }
            if let Some(suffix) = allowed.strip_prefix("*.") {
                let host = origin
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(origin);
                let host = host.split(':').next().unwrap_or(host);
                if host == suffix || host.ends_with(&format!(".{suffix}")) {
                    return Some(origin.to_string());
                }
            }
        }
        None
    }
}

/// Builder for [`HeadersConfig`].
#[derive(Debug, Clone)]
pub struct HeadersConfigBuilder {
    config: HeadersConfig,
}

impl Default for HeadersConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadersConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - `X-Content-Type-Options: nosniff` and `X-XSS-Protection: 1; mode=block`
    /// - `X-Frame-Options: DENY`, `Referrer-Policy: strict-origin-when-cross-origin`
    /// - HSTS off (max age 0); no CSP, no CORS origins, no custom headers
    pub fn new() -> Self {
        Self {
            config: HeadersConfig {
                content_security_policy: None,
                hsts_max_age: 0,
                hsts_include_subdomains: false,
                hsts_preload: false,
                frame_options: Some("DENY".to_string()),
                content_type_nosniff: true,
                xss_protection: true,
                xss_protection_mode: Some("block".to_string()),
                referrer_policy: Some("strict-origin-when-cross-origin".to_string()),
                permissions_policy: None,
                allowed_origins: Vec::new(),
                allowed_methods: vec![
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ],
                allowed_headers: vec![
                    "content-type".to_string(),
                    "authorization".to_string(),
                    "x-csrf-token".to_string(),
                ],
                allow_credentials: false,
                cors_max_age: 600,
                custom_headers: Vec::new(),
            },
        }
    }

    /// `Content-Security-Policy` value.
    pub fn content_security_policy<S: Into<String>>(mut self, csp: S) -> Self {
        self.config.content_security_policy = Some(csp.into());
        self
    }

    /// HSTS max age in seconds. Zero disables the header.
    pub fn hsts_max_age(mut self, seconds: u64) -> Self {
        self.config.hsts_max_age = seconds;
        self
    }

    /// Adds `includeSubDomains` to the HSTS header.
    pub fn hsts_include_subdomains(mut self, include: bool) -> Self {
        self.config.hsts_include_subdomains = include;
        self
    }

    /// Adds `preload` to the HSTS header.
    pub fn hsts_preload(mut self, preload: bool) -> Self {
        self.config.hsts_preload = preload;
        self
    }

    /// `X-Frame-Options` value (`DENY`, `SAMEORIGIN`). `None` omits it.
    pub fn frame_options<S: Into<String>>(mut self, value: S) -> Self {
        self.config.frame_options = Some(value.into());
        self
    }

    /// Emits `X-Content-Type-Options: nosniff`.
    pub fn content_type_nosniff(mut self, enabled: bool) -> Self {
        self.config.content_type_nosniff = enabled;
        self
    }

    /// Emits `X-XSS-Protection` with the configured mode.
    pub fn xss_protection(mut self, enabled: bool) -> Self {
        self.config.xss_protection = enabled;
        self
    }

    /// The `mode=` portion of `X-XSS-Protection` (usually `block`).
    pub fn xss_protection_mode<S: Into<String>>(mut self, mode: S) -> Self {
        self.config.xss_protection_mode = Some(mode.into());
        self
    }

    /// `Referrer-Policy` value.
    pub fn referrer_policy<S: Into<String>>(mut self, policy: S) -> Self {
        self.config.referrer_policy = Some(policy.into());
        self
    }

    /// `Permissions-Policy` value.
    pub fn permissions_policy<S: Into<String>>(mut self, policy: S) -> Self {
        self.config.permissions_policy = Some(policy.into());
        self
    }

    /// Origins allowed by CORS: exact values, `*`, or `*.suffix` patterns.
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Methods advertised on preflight responses.
    pub fn allowed_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.config.allowed_methods = methods.into_iter().collect();
        self
    }

    /// Headers advertised on preflight responses.
    pub fn allowed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Emits `Access-Control-Allow-Credentials: true`.
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.config.allow_credentials = allow;
        self
    }

    /// Preflight cache lifetime (`Access-Control-Max-Age`), in seconds.
    pub fn cors_max_age(mut self, seconds: u64) -> Self {
        self.config.cors_max_age = seconds;
        self
    }

    /// Appends an arbitrary header to every response.
    pub fn custom_header<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.config
            .custom_headers
            .push((name.into(), value.into()));
        self
    }

    /// Builds the configuration.
    ///
    /// Fails when credentials are allowed together with a wildcard origin,
    /// which browsers reject.
    pub fn build(self) -> Result<HeadersConfig, ConfigError> {
        if self.config.allow_credentials
            && self.config.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(ConfigError::Invalid {
                field: "allowed_origins",
                reason: "wildcard origin cannot be combined with credentials".to_string(),
            });
        }
        Ok(self.config)
    }
}
