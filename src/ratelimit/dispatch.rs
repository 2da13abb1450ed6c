//! Dispatch of admitted requests to the upstream.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::request::Request;
use crate::proxy::Upstream;

/// Serve an admitted request.
///
/// If the caller already abandoned the exchange the upstream is not called.
/// Otherwise the request is forwarded and the response delivered through the
/// request's completion signal. The worker slot, when one is given, is
/// released when this function returns on every path.
pub async fn serve_request(
    upstream: Arc<dyn Upstream>,
    request: Request,
    slot: Option<OwnedSemaphorePermit>,
) {
    let _slot = slot;
    let (id, inbound, reply) = request.into_parts();

    if reply.is_closed() {
        warn!(request_id = %id, "Skipping request: client disconnected");
        return;
    }

    debug!(request_id = %id, uri = %inbound.uri(), "Dispatching request");
    let response = upstream.forward(inbound).await;

    if reply.send(response).is_err() {
        debug!(request_id = %id, "Client disconnected before the response was delivered");
    }
}

/// Serve an admitted request on its own task.
pub(crate) fn spawn_dispatch(
    upstream: &Arc<dyn Upstream>,
    request: Request,
    slot: Option<OwnedSemaphorePermit>,
) {
    tokio::spawn(serve_request(upstream.clone(), request, slot));
}
