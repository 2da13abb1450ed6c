//! Admission units handed to limiters.

use axum::body::Body;
use http::{HeaderValue, Response};
use tokio::sync::oneshot;

/// Header carrying the caller supplied request identity.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// An inbound exchange waiting for admission.
///
/// The request owns the inbound HTTP request and the sending half of its
/// completion signal. The signal closes exactly once: either a response is
/// delivered through it or the request is dropped (rejected, skipped, or
/// discarded at shutdown). Limiters take requests by value, so a request can
/// be admitted into at most one limiter and dispatched at most once.
#[derive(Debug)]
pub struct Request {
    id: String,
    inbound: http::Request<Body>,
    reply: oneshot::Sender<Response<Body>>,
}

/// The caller's half of a [`Request`].
///
/// Resolves once the request has been served or abandoned. Dropping the
/// completion is how the caller side signals a disconnect.
#[derive(Debug)]
pub struct Completion {
    id: String,
    reply: oneshot::Receiver<Response<Body>>,
}

impl Request {
    /// Create a request, reusing the `X-Request-Id` header as identity when
    /// the caller supplied one.
    pub fn new(inbound: http::Request<Body>) -> (Self, Completion) {
        let id = inbound
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::with_id(id, inbound)
    }

    /// Create a request with an explicit identity.
    pub fn with_id(id: impl Into<String>, mut inbound: http::Request<Body>) -> (Self, Completion) {
        let id = id.into();
        if let Ok(value) = HeaderValue::from_str(&id) {
            inbound.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: id.clone(),
            inbound,
            reply: tx,
        };
        (request, Completion { id, reply: rx })
    }

    /// The request identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The inbound HTTP request.
    pub fn inbound(&self) -> &http::Request<Body> {
        &self.inbound
    }

    /// Whether the caller has already stopped waiting for this request.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (String, http::Request<Body>, oneshot::Sender<Response<Body>>) {
        (self.id, self.inbound, self.reply)
    }
}

impl Completion {
    /// The identity of the request this completion belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the request to finish.
    ///
    /// Returns the upstream response, or `None` if the request finished
    /// without one (it was rejected, skipped, or dropped by a stopped
    /// limiter).
    pub async fn wait(self) -> Option<Response<Body>> {
        self.reply.await.ok()
    }
}
