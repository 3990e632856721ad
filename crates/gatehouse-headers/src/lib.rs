//! Security-header emission and CORS negotiation middleware.
//!
//! Responses passing through the middleware receive the configured security
//! headers (CSP, HSTS, frame options, nosniff, XSS protection, referrer and
//! permissions policies, custom headers) and lose `Server` and
//! `X-Powered-By`. HSTS is emitted only when its max age is positive.
//!
//! CORS: when a request's `Origin` matches the allow list (exact, `*`, or
//! `*.suffix`), the allow headers are emitted; `OPTIONS` preflights
//! short-circuit with `204 No Content`.

mod config;

pub use config::{HeadersConfig, HeadersConfigBuilder};

use futures::future::BoxFuture;
use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// A Tower [`Layer`] applying [`HeadersConfig`] to a service.
#[derive(Clone)]
pub struct SecurityHeadersLayer {
    config: Arc<HeadersConfig>,
}

impl SecurityHeadersLayer {
    /// Creates a new `SecurityHeadersLayer` with the given configuration.
    pub fn new(config: HeadersConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl HeadersConfig {
    /// Wraps this configuration in a [`SecurityHeadersLayer`].
    pub fn layer(self) -> SecurityHeadersLayer {
        SecurityHeadersLayer::new(self)
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, service: S) -> Self::Service {
        SecurityHeadersService {
            inner: service,
            config: Arc::clone(&self.config),
        }
    }
}

/// A Tower [`Service`] decorating responses with security headers.
pub struct SecurityHeadersService<S> {
    inner: S,
    config: Arc<HeadersConfig>,
}

impl<S: Clone> Clone for SecurityHeadersService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

fn insert_str<B>(response: &mut Response<B>, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn apply_cors<B>(config: &HeadersConfig, response: &mut Response<B>, allow_origin: &str) {
    insert_str(
        response,
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        allow_origin,
    );
    let methods = config
        .allowed_methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    insert_str(response, header::ACCESS_CONTROL_ALLOW_METHODS, &methods);
    let headers = config.allowed_headers.join(", ");
    insert_str(response, header::ACCESS_CONTROL_ALLOW_HEADERS, &headers);
    if config.allow_credentials {
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    response.headers_mut().insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from(config.cors_max_age),
    );
}

fn apply_security_headers<B>(config: &HeadersConfig, response: &mut Response<B>) {
    let headers = response.headers_mut();
    headers.remove(header::SERVER);
    headers.remove("x-powered-by");

    if let Some(csp) = &config.content_security_policy {
        insert_str(response, header::CONTENT_SECURITY_POLICY, csp);
    }
    if let Some(hsts) = config.hsts_value() {
        insert_str(response, header::STRICT_TRANSPORT_SECURITY, &hsts);
    }
    if let Some(frame) = &config.frame_options {
        insert_str(response, header::X_FRAME_OPTIONS, frame);
    }
    if config.content_type_nosniff {
        response.headers_mut().insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
    }
    if config.xss_protection {
        let value = match &config.xss_protection_mode {
            Some(mode) => format!("1; mode={mode}"),
            None => "1".to_string(),
        };
        insert_str(response, header::X_XSS_PROTECTION, &value);
    }
    if let Some(policy) = &config.referrer_policy {
        insert_str(response, header::REFERRER_POLICY, policy);
    }
    if let Some(policy) = &config.permissions_policy {
        if let Ok(name) = HeaderName::from_bytes(b"permissions-policy") {
            if let Ok(value) = HeaderValue::from_str(policy) {
                response.headers_mut().insert(name, value);
            }
        }
    }
    for (name, value) in &config.custom_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SecurityHeadersService<S>
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
            let origin = req
                .headers()
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let allow_origin = origin.as_deref().and_then(|o| config.match_origin(o));

            // Preflight short-circuit for allowed origins.
            if req.method() == Method::OPTIONS {
                if let Some(allow_origin) = &allow_origin {
                    let mut response = Response::new(ResBody::from(String::new()));
                    *response.status_mut() = StatusCode::NO_CONTENT;
                    apply_cors(&config, &mut response, allow_origin);
                    apply_security_headers(&config, &mut response);
                    return Ok(response);
                }
            }

            let mut response = inner.call(req).await?;
            apply_security_headers(&config, &mut response);
            if let Some(allow_origin) = &allow_origin {
                apply_cors(&config, &mut response, allow_origin);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, ServiceExt};

    fn inner_with_server_header(
    ) -> tower::util::BoxCloneService<Request<String>, Response<String>, std::convert::Infallible>
    {
        tower::util::BoxCloneService::new(service_fn(|_req: Request<String>| async move {
            let mut response = Response::new("ok".to_string());
            response
                .headers_mut()
                .insert(header::SERVER, HeaderValue::from_static("hyper"));
            response
                .headers_mut()
                .insert("x-powered-by", HeaderValue::from_static("gatehouse"));
            Ok::<_, std::convert::Infallible>(response)
        }))
    }

    #[tokio::test]
    async fn default_headers_are_applied_and_fingerprints_stripped() {
        let mut service = HeadersConfig::builder()
            .build()
            .unwrap()
            .layer()
            .layer(inner_with_server_header());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::X_XSS_PROTECTION], "1; mode=block");
        assert!(headers.get(header::SERVER).is_none());
        assert!(headers.get("x-powered-by").is_none());
        // HSTS off by default.
        assert!(headers.get(header::STRICT_TRANSPORT_SECURITY).is_none());
    }

    #[tokio::test]
    async fn hsts_and_csp_are_emitted_when_configured() {
        let mut service = HeadersConfig::builder()
            .content_security_policy("default-src 'self'")
            .hsts_max_age(3600)
            .hsts_include_subdomains(true)
            .build()
            .unwrap()
            .layer()
            .layer(inner_with_server_header());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();

        assert_eq!(
            response.headers()[header::STRICT_TRANSPORT_SECURITY],
            "max-age=3600; includeSubDomains"
        );
        assert_eq!(
            response.headers()[header::CONTENT_SECURITY_POLICY],
            "default-src 'self'"
        );
    }

    #[tokio::test]
    async fn allowed_origin_gets_cors_headers() {
        let mut service = HeadersConfig::builder()
            .allowed_origins(["https://app.example.com"])
            .build()
            .unwrap()
            .layer()
            .layer(inner_with_server_header());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_204() {
        let inner_ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let inner_flag = std::sync::Arc::clone(&inner_ran);
        let mut service = HeadersConfig::builder()
            .allowed_origins(["https://app.example.com"])
            .build()
            .unwrap()
            .layer()
            .layer(service_fn(move |_req: Request<String>| {
                inner_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                async move {
                    Ok::<Response<String>, std::convert::Infallible>(Response::new(String::new()))
                }
            }));

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_MAX_AGE));
        // The preflight never reached the inner service.
        assert!(!inner_ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_origin_gets_no_cors_headers() {
        let mut service = HeadersConfig::builder()
            .allowed_origins(["https://app.example.com"])
            .build()
            .unwrap()
            .layer()
            .layer(inner_with_server_header());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://evil.example.net")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn custom_headers_are_appended() {
        let mut service = HeadersConfig::builder()
            .custom_header("x-environment", "staging")
            .build()
            .unwrap()
            .layer()
            .layer(inner_with_server_header());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.headers()["x-environment"], "staging");
    }
}
