//! WebSocket server implementation
//!
//! Listens on a configurable address, upgrades each connection to a WebSocket
//! and hands it to a [`ConnectionHandler`]. The participant's identity is the
//! last segment of the request path (`/ws/{identity}`).

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use crate::config::HubConfig;
use crate::hub::{Hub, Registry};

/// Errors that can occur while setting up a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No identity in request path {0:?}")]
    MissingIdentity(String),
}

/// WebSocket server for chat clients
pub struct WebSocketServer {
    config: Arc<HubConfig>,
    hub: Arc<Hub>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server with an empty registry
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let hub = Arc::new(Hub::new(registry, config.outbound_capacity));
        Self::with_hub(config, hub)
    }

    /// Create a server around an existing hub
    pub fn with_hub(config: HubConfig, hub: Arc<Hub>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            hub,
            shutdown_tx,
        }
    }

    /// Get the hub shared by all connections
    #[cfg(test)]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind to the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{}/{{identity}}",
            local_addr,
            self.config.path_prefix.trim_end_matches('/')
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = Arc::clone(&self.hub);
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, hub, config, shutdown_rx).await {
                                    warn!("Connection from {} rejected: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let participants = self.hub.registry().len().await;
        if participants > 0 {
            info!("Closing {} active connections...", participants);
        }

        Ok(())
    }
}

/// Upgrade a TCP stream and run it as a chat participant
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<Hub>,
    config: Arc<HubConfig>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ConnectionError> {
    debug!("New connection from {}", peer_addr);

    let mut identity = None;
    let mut requested_path = String::new();
    let handshake = accept_hdr_async(stream, |request: &Request, response: Response| {
        requested_path = request.uri().path().to_string();
        match config.identity_from_path(&requested_path) {
            Some(name) => {
                identity = Some(name);
                Ok(response)
            }
            None => Err(not_found()),
        }
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws_stream) => ws_stream,
        Err(_) if identity.is_none() && !requested_path.is_empty() => {
            return Err(ConnectionError::MissingIdentity(requested_path));
        }
        Err(e) => return Err(e.into()),
    };

    let identity = identity.ok_or_else(|| ConnectionError::MissingIdentity(requested_path))?;
    info!("{} connected as {:?}", peer_addr, identity);

    let state = ConnectionHandler::new(hub, identity, peer_addr)
        .run(ws_stream, shutdown_rx)
        .await;

    debug!("Connection from {} finished in state {:?}", peer_addr, state);
    Ok(())
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(
        "Expected a path ending in /{identity}".to_string(),
    ));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
