//! HTTP server hosting a transport's intake routes.
//!
//! Transports define routes but never spawn servers themselves; this type
//! binds the listener, merges the route fragments and runs them until
//! shutdown.

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TransportError;

/// A single HTTP server for one agent's inbound address.
pub struct ListenerServer {
    host: String,
    port: u16,
    routes: Vec<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ListenerServer {
    /// Create a server that will bind `host:port` (port 0 = OS-assigned).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            routes: Vec::new(),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Accumulate a route fragment with its state already applied.
    pub fn add_routes(&mut self, router: Router) {
        self.routes.push(router);
    }

    /// Bind the listener, merge all route fragments and spawn the server.
    ///
    /// Returns the address actually bound.
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        let mut app = Router::new();
        for fragment in self.routes.drain(..) {
            app = app.merge(fragment);
        }

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::StartupFailed {
                reason: format!("failed to bind {}:{}: {}", self.host, self.port, e),
            })?;

        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::StartupFailed {
                reason: format!("failed to get local addr: {}", e),
            })?;

        tracing::info!("Intake listener bound on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Intake listener shutting down");
                })
                .await
            {
                tracing::error!("Intake listener error: {}", e);
            }
        });

        self.handle = Some(handle);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Address bound by `start()`, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.local_addr = None;
    }
}
