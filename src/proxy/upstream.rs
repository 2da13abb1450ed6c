//! Upstream transport used to forward admitted requests.

use async_trait::async_trait;
use axum::body::Body;
use axum::response::IntoResponse;
use http::header::{self, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::{Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};

use crate::error::{GatewayError, Result};

/// Header recording the host the caller originally addressed.
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Trait for the transport that carries an admitted request upstream.
///
/// One upstream is shared read-only by every dispatch of an endpoint and
/// must tolerate any number of concurrent calls.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward a request and produce the response to hand back to the caller.
    async fn forward(&self, request: http::Request<Body>) -> Response<Body>;
}

/// Single-host HTTP reverse proxy.
///
/// The endpoint prefix is trimmed from the inbound path and the remainder is
/// joined onto the destination's base path.
pub struct HttpUpstream {
    destination: Uri,
    endpoint: String,
    client: Client<HttpConnector, Body>,
}

impl HttpUpstream {
    /// Create a proxy for `destination`, serving requests received on `endpoint`.
    pub fn new(destination: &str, endpoint: &str) -> Result<Self> {
        let destination = parse_destination(destination)?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            destination,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// The destination this proxy forwards to.
    pub fn destination(&self) -> &Uri {
        &self.destination
    }

    /// Rewrite an inbound request so it addresses the destination.
    fn rewrite(&self, request: &mut http::Request<Body>) -> Result<()> {
        let original_host = request.headers().get(header::HOST).cloned();

        let path = request.uri().path();
        let trimmed = path.strip_prefix(self.endpoint.as_str()).unwrap_or(path);
        let mut path_and_query = join_paths(self.destination.path(), trimmed);
        if let Some(query) = request.uri().query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let mut parts = self.destination.clone().into_parts();
        parts.path_and_query = Some(
            PathAndQuery::try_from(path_and_query.as_str())
                .map_err(|e| GatewayError::Server(e.to_string()))?,
        );
        *request.uri_mut() =
            Uri::from_parts(parts).map_err(|e| GatewayError::Server(e.to_string()))?;

        let headers = request.headers_mut();
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        if let Some(host) = original_host {
            headers.insert(FORWARDED_HOST_HEADER, host);
        }
        if let Some(authority) = self.destination.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, value);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, mut request: http::Request<Body>) -> Response<Body> {
        if let Err(e) = self.rewrite(&mut request) {
            error!(error = %e, "Failed to rewrite request for upstream");
            return StatusCode::BAD_GATEWAY.into_response();
        }

        debug!(uri = %request.uri(), method = %request.method(), "Redirecting upstream");

        match self.client.request(request).await {
            Ok(response) => {
                let mut response = response.map(Body::new);
                for name in &HOP_BY_HOP {
                    response.headers_mut().remove(name);
                }
                response
            }
            Err(e) => {
                error!(
                    destination = %self.destination,
                    error = %e,
                    "Upstream request failed"
                );
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

fn parse_destination(url: &str) -> Result<Uri> {
    let invalid = |reason: &str| GatewayError::InvalidUpstream {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(_) => return Err(invalid("only http destinations are supported")),
        None => return Err(invalid("missing scheme")),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host"));
    }
    if uri.query().is_some() {
        return Err(invalid("destination must not carry a query"));
    }
    Ok(uri)
}

/// Join two path segments with exactly one slash between them.
fn join_paths(base: &str, rest: &str) -> String {
    if rest.is_empty() {
        return if base.is_empty() { "/".to_string() } else { base.to_string() };
    }
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{}{}", base, &rest[1..]),
        (false, false) => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, rest),
    }
}
