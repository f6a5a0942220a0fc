//! Per-connection read/write pumps, send buffering, idle enforcement.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use fleetlink_lifecycle::{LinkEvent, LinkState, transition};
use fleetlink_protocol::constants::WS_MAX_MESSAGE_SIZE;
use fleetlink_protocol::envelope::Message;
use fleetlink_registry::ConnId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives parsed envelopes and close notifications from the pumps.
///
/// Implemented by [`crate::FleetHub`]; kept as a trait so the pumps can
/// be exercised in tests with a recording stub.
pub trait FrameHandler: Send + Sync + 'static {
    /// Called for every well-formed JSON envelope.
    fn on_message(&self, conn: ConnId, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called once when the connection ends. `normal` is `true` only for
    /// a clean close with code 1000.
    fn on_disconnected(&self, conn: ConnId, normal: bool) -> HandlerFuture<'_>;
}

/// Metadata tracked for every open connection.
#[derive(Debug)]
pub struct ConnMeta {
    pub conn_id: ConnId,
    pub remote_addr: String,
    pub opened_at: Instant,
    /// Envelopes received on this connection.
    pub messages: AtomicU64,
    /// Lifecycle state of this link, the hub's side of the shared
    /// transition table. Inbound connections start at `AwaitingConfirm`:
    /// the transport is already open when the hub learns about them.
    state: Mutex<LinkState>,
}

impl ConnMeta {
    pub fn new(conn_id: ConnId, remote_addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            remote_addr: remote_addr.into(),
            opened_at: Instant::now(),
            messages: AtomicU64::new(0),
            state: Mutex::new(LinkState::AwaitingConfirm),
        })
    }

    /// Current lifecycle state of this connection.
    pub fn link_state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    /// Applies a lifecycle event, ignoring events that are meaningless
    /// in the current state.
    pub(crate) fn advance(&self, event: LinkEvent) {
        let mut state = self.state.lock().unwrap();
        if let Some(next) = transition(*state, event) {
            if next != *state {
                tracing::debug!(
                    conn = self.conn_id,
                    from = ?state,
                    to = ?next,
                    ?event,
                    "link state"
                );
            }
            *state = next;
        }
    }
}

/// Handle for sending frames to one connection.
///
/// Cloneable and cheap, wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the connection is gone.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError::Encode)?;
        self.tx
            .try_send(WsMessage::Text(json.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("send buffer full, dropping message");
                    SendError::Full
                }
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(&req.reply_error(code, message))
    }

    /// Enqueues a close frame with an application close code. The pumps
    /// tear down once the peer completes the closing handshake, or on
    /// the idle deadline if it never does.
    pub fn send_close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.tx
            .try_send(WsMessage::Close(Some(frame)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when a frame could not be enqueued.
///
/// `Full` and `Closed` are distinct on purpose: a saturated buffer is a
/// transient condition on a live connection, a closed channel means the
/// connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode message")]
    Encode,
}

/// An open connection owned by the server.
pub struct ConnHandle {
    pub meta: Arc<ConnMeta>,
    sender: Sender,
    cancel: CancellationToken,
}

impl ConnHandle {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Tears the connection down without a closing handshake.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Builds a handle backed by a bare channel, no pumps. Lets routing
/// tests inspect exactly what the hub would have written to the wire.
#[cfg(test)]
pub(crate) fn test_handle(conn_id: ConnId) -> (ConnHandle, mpsc::Receiver<WsMessage>) {
    let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
    let handle = ConnHandle {
        meta: ConnMeta::new(conn_id, "test"),
        sender: Sender::new(tx),
        cancel: CancellationToken::new(),
    };
    (handle, rx)
}

/// Spawns the read and write pumps for an upgraded WebSocket stream.
///
/// The pumps stop when the peer closes, silence exceeds two heartbeat
/// intervals, the idle deadline fires, or the cancel token is
/// triggered; the handler's `on_disconnected` runs exactly once
/// afterwards.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: Arc<ConnMeta>,
    handler: Arc<H>,
    server_cancel: CancellationToken,
    idle_timeout: Duration,
    heartbeat_period: Duration,
) -> ConnHandle
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: FrameHandler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender::new(tx);

    let handle = ConnHandle {
        meta: Arc::clone(&meta),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone(), heartbeat_period));

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        let normal = read_pump(
            ws_stream,
            &sender,
            &handler,
            Arc::clone(&meta),
            read_cancel.clone(),
            idle_timeout,
            heartbeat_period,
        )
        .await;
        // The read pump ending always takes the write pump down with it.
        read_cancel.cancel();
        meta.advance(LinkEvent::TransportClosed { normal });
        handler.on_disconnected(meta.conn_id, normal).await;
        tracing::info!(
            conn = meta.conn_id,
            remote = %meta.remote_addr,
            normal,
            state = ?meta.link_state(),
            messages = meta.messages.load(Ordering::Relaxed),
            open_secs = meta.opened_at.elapsed().as_secs(),
            "connection closed"
        );
    });

    handle
}

/// Write pump: drains the send channel and sends transport keepalives.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
    heartbeat_period: Duration,
) where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut keepalive = tokio::time::interval(heartbeat_period);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: parses frames, enforces the silence and idle deadlines,
/// dispatches to the handler. Returns `true` for a clean close (code
/// 1000).
///
/// Silence past one heartbeat interval degrades the link; silence past
/// two intervals means the peer is dead even if TCP still accepts
/// writes, and the pump tears the connection down. Any incoming frame,
/// transport pongs included, resets both deadlines.
async fn read_pump<S, H>(
    mut stream: S,
    sender: &Sender,
    handler: &Arc<H>,
    meta: Arc<ConnMeta>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    heartbeat_period: Duration,
) -> bool
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: FrameHandler,
{
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);
    let silence = tokio::time::sleep(heartbeat_period * 2);
    tokio::pin!(silence);
    let warning = tokio::time::sleep(heartbeat_period);
    tokio::pin!(warning);
    let mut warned = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,

            _ = idle.as_mut() => {
                tracing::warn!(conn = meta.conn_id, "idle deadline reached, closing connection");
                return false;
            }

            _ = silence.as_mut() => {
                tracing::warn!(
                    conn = meta.conn_id,
                    period_secs = heartbeat_period.as_secs(),
                    "two heartbeat intervals of silence, closing connection"
                );
                meta.advance(LinkEvent::SilenceTimeout);
                return false;
            }

            _ = warning.as_mut(), if !warned => {
                tracing::debug!(conn = meta.conn_id, "silent past one heartbeat interval");
                warned = true;
                meta.advance(LinkEvent::SilenceWarning);
            }

            frame = stream.next() => {
                let now = tokio::time::Instant::now();
                idle.as_mut().reset(now + idle_timeout);
                silence.as_mut().reset(now + heartbeat_period * 2);
                warning.as_mut().reset(now + heartbeat_period);
                warned = false;
                match frame {
                    Some(Ok(ws_msg)) => match ws_msg {
                        WsMessage::Text(text) => {
                            if text.len() > WS_MAX_MESSAGE_SIZE {
                                tracing::error!(
                                    conn = meta.conn_id,
                                    "message exceeds max size ({} > {})",
                                    text.len(),
                                    WS_MAX_MESSAGE_SIZE
                                );
                                continue;
                            }
                            meta.messages.fetch_add(1, Ordering::Relaxed);
                            meta.advance(LinkEvent::FrameReceived);
                            dispatch_text(handler, sender, meta.conn_id, &text).await;
                        }
                        WsMessage::Binary(_) => {
                            // The protocol is JSON-only; a binary frame is a
                            // violation, logged and ignored.
                            tracing::warn!(conn = meta.conn_id, "unexpected binary frame ignored");
                        }
                        WsMessage::Ping(data) => {
                            let _ = sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Pong(_) => {}
                        WsMessage::Close(close_frame) => {
                            let normal = close_frame
                                .as_ref()
                                .is_none_or(|f| f.code == CloseCode::Normal);
                            tracing::debug!(conn = meta.conn_id, normal, "received close frame");
                            return normal;
                        }
                        WsMessage::Frame(_) => {} // Raw frames ignored.
                    },
                    Some(Err(e)) => {
                        tracing::error!(conn = meta.conn_id, "read pump error: {e}");
                        return false;
                    }
                    None => return false, // Stream ended without close frame.
                }
            }
        }
    }
}

async fn dispatch_text<H: FrameHandler>(
    handler: &Arc<H>,
    sender: &Sender,
    conn: ConnId,
    text: &str,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(conn, "invalid message JSON: {e}");
            return;
        }
    };
    handler.on_message(conn, sender.clone(), msg).await;
}
