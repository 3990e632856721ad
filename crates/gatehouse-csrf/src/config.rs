//! Configuration for the CSRF validator.

use crate::exempt::ExemptRules;
use cookie::SameSite;
use gatehouse_core::ConfigError;
use gatehouse_events::SecurityEventBus;
use http::Method;
use std::time::Duration;

/// How presented tokens are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfMode {
    /// The cookie token is surfaced one-time-pad masked and verified in
    /// constant time after unmasking. Default.
    Masked,
    /// The presented value must exactly match the cookie value.
    DoubleSubmit,
}

/// Configuration for the CSRF validator.
pub struct CsrfConfig {
    pub(crate) mode: CsrfMode,
    pub(crate) token_length: usize,
    pub(crate) cookie_name: String,
    pub(crate) cookie_path: String,
    pub(crate) cookie_domain: Option<String>,
    pub(crate) cookie_secure: bool,
    pub(crate) cookie_http_only: bool,
    pub(crate) cookie_same_site: SameSite,
    pub(crate) cookie_max_age: Duration,
    pub(crate) request_header: String,
    pub(crate) form_field: String,
    pub(crate) exempt: ExemptRules,
    pub(crate) enhanced: bool,
    pub(crate) suspicious_agents: Vec<String>,
    pub(crate) bus: Option<SecurityEventBus>,
    pub(crate) name: String,
}

impl std::fmt::Debug for CsrfConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfConfig")
            .field("mode", &self.mode)
            .field("token_length", &self.token_length)
            .field("cookie_name", &self.cookie_name)
            .field("cookie_path", &self.cookie_path)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_http_only", &self.cookie_http_only)
            .field("cookie_same_site", &self.cookie_same_site)
            .field("cookie_max_age", &self.cookie_max_age)
            .field("request_header", &self.request_header)
            .field("form_field", &self.form_field)
            .field("exempt", &self.exempt)
            .field("enhanced", &self.enhanced)
            .field("suspicious_agents", &self.suspicious_agents)
            .field("bus", &self.bus.is_some())
            .field("name", &self.name)
            .finish()
    }
}

impl CsrfConfig {
    /// Creates a new builder for configuring the validator.
    pub fn builder() -> CsrfConfigBuilder {
        CsrfConfigBuilder::new()
    }
}

/// Builder for [`CsrfConfig`].
pub struct CsrfConfigBuilder {
    mode: CsrfMode,
    token_length: usize,
    cookie_name: String,
    cookie_path: String,
    cookie_domain: Option<String>,
    cookie_secure: bool,
    cookie_http_only: bool,
    cookie_same_site: SameSite,
    cookie_max_age: Duration,
    request_header: String,
    form_field: String,
    exempt: ExemptRules,
    enhanced: bool,
    suspicious_agents: Vec<String>,
    bus: Option<SecurityEventBus>,
    name: String,
}

impl Default for CsrfConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrfConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - mode: masked token
    /// - token_length: 32 bytes (minimum 16)
    /// - cookie: `csrf_token`, path `/`, Secure, HttpOnly, SameSite=Strict,
    ///   max age 24h
    /// - request header `X-CSRF-Token`, form field `csrf_token`
    /// - exempt methods: GET, HEAD, OPTIONS
    /// - enhanced checks: off
    pub fn new() -> Self {
        Self {
            mode: CsrfMode::Masked,
            token_length: 32,
            cookie_name: "csrf_token".to_string(),
            cookie_path: "/".to_string(),
            cookie_domain: None,
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: SameSite::Strict,
            cookie_max_age: Duration::from_secs(86_400),
            request_header: "x-csrf-token".to_string(),
            form_field: "csrf_token".to_string(),
            exempt: ExemptRules::default(),
            enhanced: false,
            suspicious_agents: Vec::new(),
            bus: None,
            name: "<unnamed>".to_string(),
        }
    }

    /// Selects the validation mode.
    pub fn mode(mut self, mode: CsrfMode) -> Self {
        self.mode = mode;
        self
    }

    /// Token length in bytes. Must be at least 16.
    pub fn token_length(mut self, len: usize) -> Self {
        self.token_length = len;
        self
    }

    /// Cookie name.
    pub fn cookie_name<S: Into<String>>(mut self, name: S) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Cookie path attribute.
    pub fn cookie_path<S: Into<String>>(mut self, path: S) -> Self {
        self.cookie_path = path.into();
        self
    }

    /// Cookie domain attribute.
    pub fn cookie_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.cookie_domain = Some(domain.into());
        self
    }

    /// Cookie Secure attribute.
    pub fn cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    /// Cookie HttpOnly attribute.
    pub fn cookie_http_only(mut self, http_only: bool) -> Self {
        self.cookie_http_only = http_only;
        self
    }

    /// Cookie SameSite attribute.
    pub fn cookie_same_site(mut self, same_site: SameSite) -> Self {
        self.cookie_same_site = same_site;
        self
    }

    /// Cookie Max-Age.
    pub fn cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Header carrying the presented token.
    pub fn request_header<S: Into<String>>(mut self, header: S) -> Self {
        self.request_header = header.into().to_ascii_lowercase();
        self
    }

    /// Form field carrying the presented token, for callers that parse the
    /// body and insert a [`FormToken`](crate::FormToken) extension.
    pub fn form_field<S: Into<String>>(mut self, field: S) -> Self {
        self.form_field = field.into();
        self
    }

    /// Methods that bypass validation.
    pub fn exempt_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.exempt.methods = methods.into_iter().collect();
        self
    }

    /// Exact paths that bypass validation.
    pub fn exempt_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Trailing-`*` globs that bypass validation.
    pub fn exempt_globs<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt.globs = globs.into_iter().map(Into::into).collect();
        self
    }

    /// Enables the enhanced checks: Referer must contain the request Host
    /// for unsafe methods, suspicious user agents are rejected, and
    /// inconsistent forwarding headers are rejected.
    pub fn enhanced(mut self, enabled: bool) -> Self {
        self.enhanced = enabled;
        self
    }

    /// Case-insensitive substrings identifying suspicious user agents.
    pub fn suspicious_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suspicious_agents = agents
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Emits `csrf_failure` events onto the given security event bus.
    pub fn event_bus(mut self, bus: SecurityEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the name for this instance (used in logs).
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Builds the configuration.
    ///
    /// Fails if `token_length` is below 16 bytes or the cookie name is
    /// empty.
    pub fn build(self) -> Result<CsrfConfig, ConfigError> {
        if self.token_length < 16 {
            return Err(ConfigError::BelowMinimum {
                field: "token_length",
                min: 16,
            });
        }
        if self.cookie_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cookie_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(CsrfConfig {
            mode: self.mode,
            token_length: self.token_length,
            cookie_name: self.cookie_name,
            cookie_path: self.cookie_path,
            cookie_domain: self.cookie_domain,
            cookie_secure: self.cookie_secure,
            cookie_http_only: self.cookie_http_only,
            cookie_same_site: self.cookie_same_site,
            cookie_max_age: self.cookie_max_age,
            request_header: self.request_header,
            form_field: self.form_field,
            exempt: self.exempt,
            enhanced: self.enhanced,
            suspicious_agents: self.suspicious_agents,
            bus: self.bus,
            name: self.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = CsrfConfig::builder().build().unwrap();
        assert_eq!(config.mode, CsrfMode::Masked);
        assert_eq!(config.token_length, 32);
        assert!(config.cookie_http_only);
        assert_eq!(config.cookie_same_site, SameSite::Strict);
    }

    #[test]
    fn short_tokens_are_rejected() {
        let err = CsrfConfig::builder().token_length(8).build().unwrap_err();
        assert_eq!(err.to_string(), "token_length must be at least 16");
    }

    #[test]
    fn sixteen_bytes_is_the_floor() {
        assert!(CsrfConfig::builder().token_length(16).build().is_ok());
    }

    #[test]
    fn empty_cookie_name_is_rejected() {
        assert!(CsrfConfig::builder().cookie_name("").build().is_err());
    }
}
