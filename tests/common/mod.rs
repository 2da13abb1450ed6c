//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::routing::any;
use axum::Router;
use http::{Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sluice::config::GatewayConfig;
use sluice::proxy::{Gateway, GatewayServer, FORWARDED_HOST_HEADER};
use sluice::ratelimit::Registry;

/// A backend that echoes what it received.
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Backend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start an echo backend on an ephemeral port.
///
/// The body of every response is `<method> <path and query> <forwarded host>`.
pub async fn spawn_backend() -> Backend {
    async fn echo(State(hits): State<Arc<AtomicUsize>>, request: Request) -> String {
        hits.fetch_add(1, Ordering::SeqCst);
        let forwarded = request
            .headers()
            .get(FORWARDED_HOST_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{} {} {}", request.method(), target, forwarded)
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/", any(echo))
        .route("/{*rest}", any(echo))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Backend { addr, hits }
}

/// A gateway serving on an ephemeral port.
pub struct RunningGateway {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<sluice::error::Result<()>>,
}

impl RunningGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Signal shutdown and wait for the server to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

/// Start a gateway from YAML, replacing `{backend}` with the backend address.
pub async fn spawn_gateway(yaml: &str, backend: &Backend) -> RunningGateway {
    let yaml = yaml.replace("{backend}", &backend.addr.to_string());
    let config = GatewayConfig::from_yaml(&yaml).unwrap();
    let gateway = Arc::new(Gateway::build(&config, &Registry::default()).unwrap());

    let server = GatewayServer::bind("127.0.0.1:0".parse().unwrap(), gateway.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_with_shutdown(
        async move {
            let _ = rx.await;
        },
        Duration::from_secs(2),
    ));

    RunningGateway {
        addr,
        gateway,
        shutdown: Some(tx),
        task,
    }
}

pub fn client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Send a request and collect the response body as text.
pub async fn send(
    client: &Client<HttpConnector, Body>,
    method: http::Method,
    url: &str,
) -> (StatusCode, http::HeaderMap, String) {
    let request = http::Request::builder()
        .method(method)
        .uri(url)
        .body(Body::empty())
        .unwrap();
    let response = client.request(request).await.unwrap();
    collect(response.map(Body::new)).await
}

pub async fn collect(response: Response<Body>) -> (StatusCode, http::HeaderMap, String) {
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    (
        parts.status,
        parts.headers,
        String::from_utf8(bytes.to_vec()).unwrap(),
    )
}
