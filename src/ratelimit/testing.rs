//! Test helpers shared by the limiter tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use http::{Response, StatusCode};
use tokio::sync::Semaphore;

use super::request::{Completion, Request};
use crate::proxy::Upstream;

/// Upstream that counts calls and can hold responses until released.
pub(crate) struct RecordingUpstream {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Semaphore>,
}

impl RecordingUpstream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: None,
        })
    }

    /// An upstream whose calls block until [`RecordingUpstream::release`].
    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: Some(Semaphore::new(0)),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn forward(&self, _request: http::Request<Body>) -> Response<Body> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("ok"))
            .unwrap()
    }
}

pub(crate) fn request() -> (Request, Completion) {
    let inbound = http::Request::builder()
        .uri("/test")
        .body(Body::empty())
        .unwrap();
    Request::new(inbound)
}

/// Let spawned tasks run to their next suspension point.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
