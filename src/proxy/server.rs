//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::gateway::Gateway;
use crate::error::{GatewayError, Result};

/// HTTP server for the gateway.
pub struct GatewayServer {
    /// Bound listener
    listener: TcpListener,
    /// The gateway being served
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, gateway: Arc<Gateway>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to bind listener");
            GatewayError::Io(e)
        })?;
        Ok(Self { listener, gateway })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then stop the limiters and drain.
    ///
    /// Connections still open after `grace` are cut.
    pub async fn serve_with_shutdown<F>(self, signal: F, grace: Duration) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        let Self { listener, gateway } = self;
        let router = gateway.router();
        let drain = CancellationToken::new();

        info!(
            addr = %addr,
            resources = gateway.resources().len(),
            "Starting gateway server"
        );

        let token = drain.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        tokio::select! {
            joined = &mut server => {
                gateway.stop();
                return flatten(joined);
            }
            _ = signal => {}
        }

        gateway.stop();
        drain.cancel();
        info!(grace = ?grace, "Draining open connections");

        match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(grace = ?grace, "Grace period elapsed; closing remaining connections");
                server.abort();
                Ok(())
            }
        }
    }
}

fn flatten(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Gateway server failed");
            Err(GatewayError::Io(e))
        }
        Err(e) => {
            error!(error = %e, "Gateway server task failed");
            Err(GatewayError::Server(e.to_string()))
        }
    }
}
