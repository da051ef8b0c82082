//! WebSocket connection handler
//!
//! Drives one participant through its lifecycle: join on accept, relay every
//! inbound text frame, leave exactly once when the connection ends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use crate::hub::{Hub, Membership};

/// How long a closing connection may spend flushing queued messages
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, not yet registered
    Connecting,
    /// Registered and relaying messages
    Active,
    /// Removed from the hub (terminal)
    Closed,
}

/// Handles a single accepted WebSocket connection
pub struct ConnectionHandler {
    hub: Arc<Hub>,
    identity: String,
    peer_addr: SocketAddr,
    state: ConnectionState,
    drain_timeout: Duration,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(hub: Arc<Hub>, identity: impl Into<String>, peer_addr: SocketAddr) -> Self {
        Self {
            hub,
            identity: identity.into(),
            peer_addr,
            state: ConnectionState::Connecting,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Set how long the writer may keep flushing after the connection closes
    #[cfg(test)]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Current lifecycle state
    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection until the peer goes away or shutdown is signalled
    pub async fn run<S>(
        mut self,
        ws_stream: WebSocketStream<S>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (member, mut outbound) = self.hub.join(self.identity.clone()).await;
        self.state = ConnectionState::Active;

        // Writer: drains this participant's queue so a slow socket only
        // delays its own deliveries
        let peer_addr = self.peer_addr;
        let mut writer = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    debug!("Write to {} failed: {}", peer_addr, e);
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {}", self.peer_addr, text);
                            match self.hub.relay(&member, &text).await {
                                Ok(report) => debug!(
                                    "Relayed to {} participants, {} dropped",
                                    report.delivered,
                                    report.evicted.len()
                                ),
                                Err(e) => {
                                    warn!("Not relaying from {}: {}", self.peer_addr, e);
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", self.peer_addr, data.len());
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                            // Control frames are answered by tungstenite
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", self.peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("WebSocket error from {}: {}", self.peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", self.peer_addr);
                            break;
                        }
                    }
                }
                _ = member.handle().evicted() => {
                    warn!("{} ({}) was dropped by the hub, closing", member.identity(), self.peer_addr);
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", self.peer_addr);
                    break;
                }
            }
        }

        self.close(&member).await;

        // Dropping the last handle lets the writer flush and send a close frame
        drop(member);
        if timeout(self.drain_timeout, &mut writer).await.is_err() {
            debug!("Writer for {} still blocked, aborting", self.peer_addr);
            writer.abort();
        }

        self.state
    }

    /// Leave the hub, once
    async fn close(&mut self, member: &Membership) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        if self.hub.leave(member).await.is_none() {
            debug!(
                "{} ({}) was already removed from the hub",
                member.identity(),
                self.peer_addr
            );
        }
    }
}
