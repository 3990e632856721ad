//! CSRF protection middleware.
//!
//! A random base token lives in a cookie. Safe responses surface it in the
//! `X-CSRF-Token` header — one-time-pad masked in the default mode, so the
//! surfaced value changes per response — and every state-changing request
//! must echo it back via the configured header or form field. Verification
//! is constant-time.
//!
//! Requests are exempt when their method is safe, their path is listed
//! exactly, or a trailing-`*` glob matches at a path boundary (`..` anywhere
//! disqualifies the match). The enhanced mode additionally requires a
//! `Referer` containing the request host for unsafe methods and rejects
//! suspicious user agents and inconsistent forwarding headers.
//!
//! Failures are answered `403` — JSON for AJAX and `/api/*` requests, plain
//! text otherwise — and emitted as `csrf_failure` security events.
//!
//! Bodies are not buffered by the middleware. Callers that accept the token
//! as a form field parse the body themselves and insert a [`FormToken`]
//! request extension (see [`extract_form_token`]).

mod config;
mod exempt;
mod layer;
pub mod token;

pub use config::{CsrfConfig, CsrfConfigBuilder, CsrfMode};
pub use exempt::ExemptRules;
pub use layer::CsrfLayer;

use cookie::Cookie;
use futures::future::BoxFuture;
use gatehouse_events::{SecurityAction, SecurityEvent, SecurityEventKind, Severity};
use http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// Token recovered from a parsed request body, inserted as a request
/// extension by the application before this middleware runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormToken(pub String);

/// Pulls `field` out of an `application/x-www-form-urlencoded` body.
///
/// Tokens are hex, so no percent-decoding is required.
pub fn extract_form_token(body: &str, field: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == field).then(|| value.to_string())
    })
}

/// Response header surfacing the (masked) token on safe responses.
pub const TOKEN_HEADER: &str = "x-csrf-token";

/// A Tower [`Service`] validating CSRF tokens on state-changing requests.
pub struct CsrfService<S> {
    inner: S,
    config: Arc<CsrfConfig>,
}

impl<S> CsrfService<S> {
    /// Creates a new service wrapping `inner`.
    pub fn new(inner: S, config: Arc<CsrfConfig>) -> Self {
        Self { inner, config }
    }
}

impl<S: Clone> Clone for CsrfService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

fn cookie_token<B>(req: &Request<B>, name: &str) -> Option<String> {
    for value in req.headers().get_all(COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for piece in Cookie::split_parse(value).flatten() {
            if piece.name() == name {
                return Some(piece.value().to_string());
            }
        }
    }
    None
}

fn wants_json<B>(req: &Request<B>) -> bool {
    let ajax = req
        .headers()
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"));
    ajax || req.uri().path().starts_with("/api/")
}

/// Why validation failed, for logs and event details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    MissingCookie,
    MissingToken,
    Mismatch,
    BadReferer,
    SuspiciousAgent,
    InconsistentForwarding,
}

impl Failure {
    fn as_str(self) -> &'static str {
        match self {
            Failure::MissingCookie => "missing csrf cookie",
            Failure::MissingToken => "missing csrf token",
            Failure::Mismatch => "token mismatch",
            Failure::BadReferer => "referer does not match host",
            Failure::SuspiciousAgent => "suspicious user agent",
            Failure::InconsistentForwarding => "inconsistent forwarding headers",
        }
    }
}

impl<S> CsrfService<S> {
    fn enhanced_check<B>(&self, req: &Request<B>) -> Result<(), Failure> {
        let config = &self.config;

        let agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if config
            .suspicious_agents
            .iter()
            .any(|needle| agent.contains(needle))
        {
            return Err(Failure::SuspiciousAgent);
        }

        let real_ip = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok());
        let forwarded_first = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim);
        if let (Some(real), Some(forwarded)) = (real_ip, forwarded_first) {
            if real.trim() != forwarded {
                return Err(Failure::InconsistentForwarding);
            }
        }

        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let referer = req
            .headers()
            .get(http::header::REFERER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if host.is_empty() || !referer.contains(host) {
            return Err(Failure::BadReferer);
        }

        Ok(())
    }

    fn validate<B>(&self, req: &Request<B>, cookie: Option<&str>) -> Result<(), Failure> {
        let config = &self.config;

        if config.enhanced {
            self.enhanced_check(req)?;
        }

        let Some(cookie) = cookie else {
            return Err(Failure::MissingCookie);
        };

        let presented = req
            .headers()
            .get(config.request_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.extensions().get::<FormToken>().map(|t| t.0.clone()));
        let Some(presented) = presented else {
            return Err(Failure::MissingToken);
        };

        let valid = match config.mode {
            CsrfMode::Masked => token::verify(cookie, &presented),
            CsrfMode::DoubleSubmit => token::verify_exact(cookie, &presented),
        };
        if valid {
            Ok(())
        } else {
            Err(Failure::Mismatch)
        }
    }

    fn issue_cookie(&self) -> Option<(String, HeaderValue)> {
        let config = &self.config;
        let value = token::generate(config.token_length).ok()?;

        let mut builder = Cookie::build((config.cookie_name.clone(), value.clone()))
            .path(config.cookie_path.clone())
            .secure(config.cookie_secure)
            .http_only(config.cookie_http_only)
            .same_site(config.cookie_same_site)
            .max_age(cookie::time::Duration::seconds(
                config.cookie_max_age.as_secs() as i64,
            ));
        if let Some(domain) = &config.cookie_domain {
            builder = builder.domain(domain.clone());
        }

        let header = HeaderValue::from_str(&builder.build().to_string()).ok()?;
        Some((value, header))
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CsrfService<S>
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
        let service = self.clone();

        Box::pin(async move {
            let cookie = cookie_token(&req, &config.cookie_name);
            let exempt = config.exempt.is_exempt(req.method(), req.uri().path());

            if !exempt {
                if let Err(failure) = service.validate(&req, cookie.as_deref()) {
                    tracing::debug!(
                        validator = %config.name,
                        reason = failure.as_str(),
                        path = req.uri().path(),
                        "CSRF validation failed"
                    );

                    if let Some(bus) = &config.bus {
                        let client_ip = req
                            .extensions()
                            .get::<gatehouse_events::ClientIp>()
                            .map(|ip| ip.to_string())
                            .unwrap_or_default();
                        bus.emit(
                            SecurityEvent::new(
                                SecurityEventKind::CsrfFailure,
                                Severity::Medium,
                                SecurityAction::Blocked,
                                format!("CSRF validation failed: {}", failure.as_str()),
                            )
                            .with_client_ip(client_ip)
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

                    let mut response = if wants_json(&req) {
                        let body = serde_json::json!({
                            "error": "CSRF token mismatch",
                            "code": "CSRF_ERROR",
                        })
                        .to_string();
                        let mut response = Response::new(ResBody::from(body));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        response
                    } else {
                        let mut response =
                            Response::new(ResBody::from("CSRF token mismatch".to_string()));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                        response
                    };
                    *response.status_mut() = StatusCode::FORBIDDEN;
                    return Ok(response);
                }
            }

            let safe = [Method::GET, Method::HEAD, Method::OPTIONS].contains(req.method());
            let mut response = inner.call(req).await?;

            // Establish the cookie on first contact, then surface the token
            // on safe responses so clients can echo it back.
            let active_token = match cookie {
                Some(value) => Some(value),
                None => match service.issue_cookie() {
                    Some((value, header)) => {
                        response.headers_mut().append(SET_COOKIE, header);
                        Some(value)
                    }
                    None => {
                        tracing::warn!("random source unavailable, CSRF cookie not issued");
                        None
                    }
                },
            };

            if safe {
                if let Some(active) = active_token {
                    let surfaced = match config.mode {
                        CsrfMode::Masked => token::mask(&active).ok(),
                        CsrfMode::DoubleSubmit => Some(active),
                    };
                    if let Some(surfaced) = surfaced {
                        if let Ok(value) = HeaderValue::from_str(&surfaced) {
                            response.headers_mut().insert(TOKEN_HEADER, value);
                        }
                    }
                }
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, Layer, ServiceExt};

    fn ok_service(
    ) -> tower::util::BoxCloneService<Request<String>, Response<String>, std::convert::Infallible>
    {
        tower::util::BoxCloneService::new(service_fn(|_req: Request<String>| async move {
            Ok::<_, std::convert::Infallible>(Response::new("ok".to_string()))
        }))
    }

    fn layer() -> CsrfLayer {
        CsrfConfig::builder().build().unwrap().layer()
    }

    async fn get_token_and_cookie(
        service: &mut (impl Service<
            Request<String>,
            Response = Response<String>,
            Error = std::convert::Infallible,
        > + Clone),
    ) -> (String, String) {
        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();
        let token = response.headers()[TOKEN_HEADER].to_str().unwrap().to_string();
        let cookie = response.headers()[SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        (token, cookie)
    }

    #[tokio::test]
    async fn get_issues_cookie_and_token() {
        let mut service = layer().layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;
        assert!(!token.is_empty());
        assert!(cookie.starts_with("csrf_token="));
    }

    #[tokio::test]
    async fn cookie_attributes_follow_configuration() {
        let layer = CsrfConfig::builder()
            .cookie_name("anti_forgery")
            .cookie_secure(true)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("anti_forgery="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Secure"));
        assert!(set_cookie.contains("SameSite=Strict"));
    }

    #[tokio::test]
    async fn post_without_token_is_rejected_with_text() {
        let mut service = layer().layer(ok_service());
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body(), "CSRF token mismatch");
    }

    #[tokio::test]
    async fn api_requests_get_a_json_denial() {
        let mut service = layer().layer(ok_service());
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/things")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["code"], "CSRF_ERROR");
    }

    #[tokio::test]
    async fn echoed_masked_token_is_accepted() {
        let mut service = layer().layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &token)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn form_token_extension_is_accepted() {
        let mut service = layer().layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;

        let body = format!("name=x&csrf_token={token}");
        let extracted = extract_form_token(&body, "csrf_token").unwrap();

        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/form")
            .header(COOKIE, &cookie)
            .body(String::new())
            .unwrap();
        req.extensions_mut().insert(FormToken(extracted));

        let response = service.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let mut service = layer().layer(ok_service());
        let (_, cookie) = get_token_and_cookie(&mut service).await;
        let forged = token::generate(32).unwrap();

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &forged)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn exempt_glob_bypasses_validation() {
        let layer = CsrfConfig::builder()
            .exempt_globs(["/api/*"])
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());

        // Matching the glob bypasses.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/users")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // A lookalike prefix does not.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/apikey")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Traversal cannot reach the exemption.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/../secret")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn enhanced_mode_requires_matching_referer() {
        let layer = CsrfConfig::builder()
            .enhanced(true)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;

        // No referer: rejected even with a valid token.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(http::header::HOST, "example.com")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &token)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Matching referer passes.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(http::header::HOST, "example.com")
                    .header(http::header::REFERER, "https://example.com/form")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &token)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enhanced_mode_rejects_suspicious_agents() {
        let layer = CsrfConfig::builder()
            .enhanced(true)
            .suspicious_agents(["sqlmap"])
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(http::header::HOST, "example.com")
                    .header(http::header::REFERER, "https://example.com/")
                    .header(http::header::USER_AGENT, "sqlmap/1.7")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &token)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn double_submit_mode_requires_exact_match() {
        let layer = CsrfConfig::builder()
            .mode(CsrfMode::DoubleSubmit)
            .build()
            .unwrap()
            .layer();
        let mut service = layer.layer(ok_service());
        let (token, cookie) = get_token_and_cookie(&mut service).await;

        // In double-submit mode the surfaced token equals the cookie value.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/form")
                    .header(COOKIE, &cookie)
                    .header(TOKEN_HEADER, &token)
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
