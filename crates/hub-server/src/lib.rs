//! Hub WebSocket server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and routes
//! parsed envelopes into the device registry, the liveness reconciler,
//! and the command dispatcher. A connection's role is decided by its
//! first meaningful frame: `device_status` makes it an agent bound to a
//! device identifier, `observer_identify` subscribes it to registry
//! change notifications. Until then it is just an open socket with an
//! idle clock running.

pub mod broadcast;
pub mod connection;
pub mod http;
pub mod hub;
pub mod server;

pub use broadcast::ObserverBroadcast;
pub use connection::{ConnHandle, ConnMeta, FrameHandler, HandlerFuture, Sender};
pub use hub::{FleetHub, HubTuning};
pub use server::{HubServer, ServerConfig};

/// Send buffer capacity per connection.
///
/// A snapshot push plus a burst of registry notifications fits with
/// headroom; a slow observer that falls further behind than this
/// misses notifications rather than backpressuring the hub.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] fleetlink_store::StoreError),
}
