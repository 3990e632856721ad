use crate::{CsrfConfig, CsrfService};
use std::sync::Arc;
use tower::Layer;

/// A Tower [`Layer`] that applies CSRF validation to an HTTP service.
///
/// ```
/// use gatehouse_csrf::CsrfConfig;
/// use tower::ServiceBuilder;
///
/// # async fn example() {
/// let layer = CsrfConfig::builder()
///     .exempt_globs(["/api/*"])
///     .enhanced(true)
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
#[derive(Clone)]
pub struct CsrfLayer {
    config: Arc<CsrfConfig>,
}

impl CsrfLayer {
    /// Creates a new `CsrfLayer` with the given configuration.
    pub fn new(config: CsrfConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl CsrfConfig {
    /// Wraps this configuration in a [`CsrfLayer`].
    pub fn layer(self) -> CsrfLayer {
        CsrfLayer::new(self)
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CsrfService::new(service, Arc::clone(&self.config))
    }
}
