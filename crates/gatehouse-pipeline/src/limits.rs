//! Request bounds: size, content type, and wall-clock time.

use futures::future::BoxFuture;
use gatehouse_core::ConfigError;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};

/// Bounds applied to every request before the protection stack runs.
#[derive(Debug, Clone, Default)]
pub struct BoundsConfig {
    pub(crate) max_body_bytes: Option<u64>,
    pub(crate) allowed_content_types: Option<Vec<String>>,
    pub(crate) timeout: Option<Duration>,
}

impl BoundsConfig {
    /// Creates a new builder.
    pub fn builder() -> BoundsConfigBuilder {
        BoundsConfigBuilder::default()
    }
}

/// Builder for [`BoundsConfig`]. By default nothing is bounded.
#[derive(Debug, Clone, Default)]
pub struct BoundsConfigBuilder {
    config: BoundsConfig,
}

impl BoundsConfigBuilder {
    /// Rejects requests whose `Content-Length` exceeds `max` with `413`.
    pub fn max_body_bytes(mut self, max: u64) -> Self {
        self.config.max_body_bytes = Some(max);
        self
    }

    /// Restricts body-carrying requests to the given content-type prefixes;
    /// anything else is rejected with `415`.
    pub fn allowed_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_content_types = Some(
            types
                .into_iter()
                .map(|s| s.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Bounds the whole downstream call; expiry answers `503`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<BoundsConfig, ConfigError> {
        if matches!(self.config.timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::NonPositive { field: "timeout" });
        }
        if matches!(self.config.max_body_bytes, Some(0)) {
            return Err(ConfigError::NonPositive {
                field: "max_body_bytes",
            });
        }
        Ok(self.config)
    }
}

/// A Tower [`Layer`] applying [`BoundsConfig`].
#[derive(Clone)]
pub struct BoundsLayer {
    config: Arc<BoundsConfig>,
}

impl BoundsLayer {
    /// Creates a new `BoundsLayer`.
    pub fn new(config: BoundsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl BoundsConfig {
    /// Wraps this configuration in a [`BoundsLayer`].
    pub fn layer(self) -> BoundsLayer {
        BoundsLayer::new(self)
    }
}

impl<S> Layer<S> for BoundsLayer {
    type Service = BoundsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        BoundsService {
            inner: service,
            config: Arc::clone(&self.config),
        }
    }
}

/// A Tower [`Service`] enforcing request bounds.
pub struct BoundsService<S> {
    inner: S,
    config: Arc<BoundsConfig>,
}

impl<S: Clone> Clone for BoundsService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

fn text_response<B: From<String>>(status: StatusCode, body: &str) -> Response<B> {
    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for BoundsService<S>
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
            if let Some(max) = config.max_body_bytes {
                let declared = req
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if matches!(declared, Some(len) if len > max) {
                    tracing::debug!(max, "request body too large");
                    return Ok(text_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "Request entity too large",
                    ));
                }
            }

            if let Some(allowed) = &config.allowed_content_types {
                let has_body =
                    [Method::POST, Method::PUT, Method::PATCH].contains(req.method());
                if has_body {
                    if let Some(content_type) = req
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                    {
                        let content_type = content_type.to_ascii_lowercase();
                        if !allowed.iter().any(|a| content_type.starts_with(a)) {
                            tracing::debug!(content_type, "unsupported content type");
                            return Ok(text_response(
                                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                                "Unsupported content type",
                            ));
                        }
                    }
                }
            }

            match config.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, inner.call(req)).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(timeout_ms = timeout.as_millis(), "request timed out");
                            Ok(text_response(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "Request timeout",
                            ))
                        }
                    }
                }
                None => inner.call(req).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::{service_fn, ServiceExt};

    fn ok_service(
    ) -> tower::util::BoxCloneService<Request<String>, Response<String>, std::convert::Infallible>
    {
        tower::util::BoxCloneService::new(service_fn(|_req: Request<String>| async move {
            Ok::<_, std::convert::Infallible>(Response::new("ok".to_string()))
        }))
    }

    #[tokio::test]
    async fn oversize_declared_bodies_get_413() {
        let mut service = BoundsConfig::builder()
            .max_body_bytes(10)
            .build()
            .unwrap()
            .layer()
            .layer(ok_service());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(CONTENT_LENGTH, "1000")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn wrong_content_type_gets_415() {
        let mut service = BoundsConfig::builder()
            .allowed_content_types(["application/json"])
            .build()
            .unwrap()
            .layer()
            .layer(ok_service());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(CONTENT_TYPE, "text/xml")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // GET requests carry no body and are not content-type checked.
        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_handlers_get_503() {
        let slow = service_fn(|_req: Request<String>| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, std::convert::Infallible>(Response::new("late".to_string()))
        });
        let mut service = BoundsConfig::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap()
            .layer()
            .layer(slow);

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::builder().uri("/").body(String::new()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body(), "Request timeout");
    }

    #[tokio::test]
    async fn unbounded_config_passes_everything() {
        let mut service = BoundsConfig::builder()
            .build()
            .unwrap()
            .layer()
            .layer(ok_service());

        let response = service
            .ready()
            .await
            .unwrap()
            .call(
                Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(CONTENT_LENGTH, "999999999")
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(String::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
