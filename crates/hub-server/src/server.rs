//! WebSocket accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use fleetlink_protocol::constants::{CONNECTION_IDLE_TIMEOUT, HEARTBEAT_PERIOD, WS_MAX_MESSAGE_SIZE};
use fleetlink_registry::ConnId;

use crate::HubError;
use crate::connection::{self, ConnMeta};
use crate::hub::FleetHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// Idle ceiling for every connection.
    pub idle_timeout: Duration,
    /// Heartbeat interval; silence past twice this tears a link down.
    pub heartbeat_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 9300).into(),
            idle_timeout: CONNECTION_IDLE_TIMEOUT,
            heartbeat_period: HEARTBEAT_PERIOD,
        }
    }
}

/// The hub WebSocket server.
///
/// Accepts any number of concurrent connections; each gets its own pump
/// pair and a fleet-unique connection id. All routing goes through the
/// shared [`FleetHub`].
pub struct HubServer {
    config: ServerConfig,
    hub: Arc<FleetHub>,
    cancel: CancellationToken,
    next_conn: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HubServer {
    pub fn new(config: ServerConfig, hub: Arc<FleetHub>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            cancel,
            next_conn: AtomicU64::new(1),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`HubServer::run`] binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("hub listening on {local_addr}");

        self.hub.run_background(&self.cancel).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("hub server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and hands it to the hub.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HubError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let conn_id: ConnId = self.next_conn.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%peer_addr, conn = conn_id, "WebSocket connection established");

        let meta = ConnMeta::new(conn_id, peer_addr.to_string());
        let handle = connection::spawn_connection(
            ws_stream,
            meta,
            Arc::clone(&self.hub),
            self.cancel.clone(),
            self.config.idle_timeout,
            self.config.heartbeat_period,
        );
        self.hub.register_connection(handle);
        Ok(())
    }
}
