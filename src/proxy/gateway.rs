//! Routing of inbound calls to the limiter of their endpoint and method.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request as AxumRequest, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use tracing::{debug, info, instrument, warn};

use super::upstream::{HttpUpstream, Upstream};
use crate::config::{normalize_endpoint, GatewayConfig, ResourceConfig};
use crate::error::Result;
use crate::ratelimit::{Limiter, Registry, Request, REQUEST_ID_HEADER};

/// A proxied endpoint with one limiter per configured method.
pub struct Resource {
    name: String,
    endpoint: String,
    limiters: HashMap<Method, Box<dyn Limiter>>,
    allow: HeaderValue,
}

impl Resource {
    /// Build the limiters of one resource around a shared upstream.
    pub fn new(
        config: &ResourceConfig,
        registry: &Registry,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let mut limiters = HashMap::new();
        for (method, limit) in config.methods()? {
            let params = limit.params()?;
            let limiter = registry.build(&limit.strategy, &params, upstream.clone())?;
            info!(
                resource = %config.name,
                method = %method,
                strategy = limiter.name(),
                capacity = params.capacity.get(),
                quantity = params.quantity.get(),
                interval = ?params.interval,
                "Limiter started"
            );
            limiters.insert(method, limiter);
        }

        let mut methods: Vec<&str> = limiters.keys().map(Method::as_str).collect();
        methods.sort_unstable();
        let allow = HeaderValue::from_str(&methods.join(", "))
            .unwrap_or_else(|_| HeaderValue::from_static(""));

        Ok(Self {
            name: config.name.clone(),
            endpoint: normalize_endpoint(&config.endpoint),
            limiters,
            allow,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The limiter guarding `method`, if one is configured.
    pub fn limiter(&self, method: &Method) -> Option<&dyn Limiter> {
        self.limiters.get(method).map(|limiter| limiter.as_ref())
    }

    fn stop(&self) {
        for (method, limiter) in &self.limiters {
            limiter.stop();
            debug!(resource = %self.name, method = %method, "Limiter stopped");
        }
    }
}

/// The set of proxied resources.
pub struct Gateway {
    resources: Vec<Arc<Resource>>,
}

impl Gateway {
    /// Build every resource with an HTTP upstream for its destination.
    pub fn build(config: &GatewayConfig, registry: &Registry) -> Result<Self> {
        Self::with_upstreams(config, registry, |resource| {
            let upstream = HttpUpstream::new(&resource.destination_url, &resource.endpoint)?;
            Ok(Arc::new(upstream) as Arc<dyn Upstream>)
        })
    }

    /// Build every resource, creating its upstream with `make_upstream`.
    ///
    /// If any resource fails to build, the limiters already started are
    /// stopped before the error is returned.
    pub fn with_upstreams<F>(
        config: &GatewayConfig,
        registry: &Registry,
        mut make_upstream: F,
    ) -> Result<Self>
    where
        F: FnMut(&ResourceConfig) -> Result<Arc<dyn Upstream>>,
    {
        config.validate()?;

        let mut gateway = Self {
            resources: Vec::with_capacity(config.resources.len()),
        };
        for resource in &config.resources {
            let built = make_upstream(resource)
                .and_then(|upstream| Resource::new(resource, registry, upstream));
            match built {
                Ok(built) => gateway.resources.push(Arc::new(built)),
                Err(e) => {
                    gateway.stop();
                    return Err(e);
                }
            }
        }
        Ok(gateway)
    }

    pub fn resources(&self) -> &[Arc<Resource>] {
        &self.resources
    }

    /// An axum router serving every resource.
    ///
    /// Each endpoint answers both on its exact path and on any path below it.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for resource in &self.resources {
            let base = resource.endpoint.trim_end_matches('/');
            let exact = if base.is_empty() { "/" } else { base };
            let nested = format!("{}/{{*rest}}", base);

            router = router.merge(
                Router::new()
                    .route(exact, any(handle))
                    .route(&nested, any(handle))
                    .with_state(resource.clone()),
            );
        }
        router
    }

    /// Stop every limiter.
    pub fn stop(&self) {
        for resource in &self.resources {
            resource.stop();
        }
        info!(resources = self.resources.len(), "All limiters stopped");
    }
}

/// Admit an inbound call and wait for its response.
///
/// The handler future is dropped when the caller disconnects, which drops
/// the completion and lets the dispatcher skip the upstream call.
#[instrument(
    skip_all,
    fields(
        resource = %resource.name,
        method = %inbound.method(),
        request_id = tracing::field::Empty
    )
)]
async fn handle(State(resource): State<Arc<Resource>>, inbound: AxumRequest) -> Response {
    let Some(limiter) = resource.limiter(inbound.method()) else {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, resource.allow.clone())],
        )
            .into_response();
    };

    debug!(path = %inbound.uri().path(), "Request received");

    let (request, completion) = Request::new(inbound);
    let request_id = request.id().to_string();
    tracing::Span::current().record("request_id", request_id.as_str());

    if !limiter.add_request(request) {
        warn!(strategy = limiter.name(), "Request throttled");
        return with_request_id(
            (StatusCode::TOO_MANY_REQUESTS, "429 Too Many Requests").into_response(),
            &request_id,
        );
    }

    let disconnect = DisconnectLog::armed(&request_id);
    let response = match completion.wait().await {
        Some(response) => response,
        None => (StatusCode::SERVICE_UNAVAILABLE, "503 Service Unavailable").into_response(),
    };
    disconnect.disarm();

    with_request_id(response, &request_id)
}

fn with_request_id(mut response: Response<Body>, request_id: &str) -> Response<Body> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Logs a caller disconnect when the handler is dropped while waiting.
struct DisconnectLog<'a> {
    request_id: &'a str,
    armed: bool,
}

impl<'a> DisconnectLog<'a> {
    fn armed(request_id: &'a str) -> Self {
        Self {
            request_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectLog<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(request_id = %self.request_id, "Client disconnected while waiting");
        }
    }
}
