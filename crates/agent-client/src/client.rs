//! One connection lifetime: dial, confirm, heartbeat, teardown.

use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use fleetlink_lifecycle::{LinkEvent, LinkState, transition};
use fleetlink_protocol::constants::{MessageType, WS_CLOSE_SUPERSEDED, WS_MAX_MESSAGE_SIZE};
use fleetlink_protocol::envelope::Message;
use fleetlink_protocol::messages::{
    CommandAck, CommandDelivery, DeviceReport, PingPayload, PongPayload,
};

use crate::heartbeat::period_for;
use crate::session::{AgentConfig, CommandCallback};
use crate::{AgentError, StatusSource};

/// How one connection attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkOutcome {
    /// The hub spoke at least once on this connection.
    pub confirmed: bool,
    /// The link ended with a clean close (code 1000).
    pub normal: bool,
    /// The session was told to stop; do not reconnect.
    pub cancelled: bool,
}

/// Applies a lifecycle event, logging real transitions and ignoring
/// events that are meaningless in the current state.
pub(crate) fn advance(state: &mut LinkState, event: LinkEvent) {
    if let Some(next) = transition(*state, event) {
        if next != *state {
            debug!(from = ?state, to = ?next, ?event, "link state");
        }
        *state = next;
    }
}

/// Dials the hub and runs the link until it dies or is cancelled.
pub(crate) async fn run_link(
    config: &AgentConfig,
    status: &Arc<dyn StatusSource>,
    activity: &mut watch::Receiver<bool>,
    on_command: &CommandCallback,
    state: &mut LinkState,
    cancel: &CancellationToken,
) -> LinkOutcome {
    let failed = LinkOutcome {
        confirmed: false,
        normal: false,
        cancelled: false,
    };

    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let ws_stream = match tokio_tungstenite::connect_async_with_config(
        config.hub_url.as_str(),
        Some(ws_config),
        false,
    )
    .await
    {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(url = %config.hub_url, "dial failed: {e}");
            advance(state, LinkEvent::TransportClosed { normal: false });
            return failed;
        }
    };
    advance(state, LinkEvent::TransportOpened);

    let (write, mut read) = ws_stream.split();
    let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(64);
    let write_cancel = cancel.child_token();
    let write_handle = tokio::spawn(write_pump(write, write_rx, write_cancel.clone()));

    let outcome = drive_link(
        config,
        status,
        activity,
        on_command,
        state,
        cancel,
        &write_tx,
        &mut read,
    )
    .await;

    write_cancel.cancel();
    let _ = write_handle.await;
    outcome
}

/// The read side of an open link: confirmation, heartbeats, routing.
#[allow(clippy::too_many_arguments)]
async fn drive_link(
    config: &AgentConfig,
    status: &Arc<dyn StatusSource>,
    activity: &mut watch::Receiver<bool>,
    on_command: &CommandCallback,
    state: &mut LinkState,
    cancel: &CancellationToken,
    write_tx: &mpsc::Sender<tungstenite::Message>,
    read: &mut (impl StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin),
) -> LinkOutcome {
    let mut confirmed = false;
    let mut warned = false;
    let mut active = *activity.borrow();
    let mut period = period_for(active, config.idle_heartbeat, config.active_heartbeat);

    // Announce the device; the hub's reply (any frame) is confirmation.
    if let Err(e) = send_report(config, status, write_tx).await {
        warn!("failed to send status report: {e}");
        advance(state, LinkEvent::TransportClosed { normal: false });
        return LinkOutcome {
            confirmed: false,
            normal: false,
            cancelled: false,
        };
    }

    let confirm_deadline = tokio::time::sleep(config.confirm_timeout);
    tokio::pin!(confirm_deadline);
    // Armed for real once confirmed; until then the confirm deadline rules.
    let silence_deadline = tokio::time::sleep(period * 2);
    tokio::pin!(silence_deadline);
    let warning_deadline = tokio::time::sleep(period);
    tokio::pin!(warning_deadline);
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // Skip the immediate first tick.

    macro_rules! reset_silence {
        () => {{
            let now = tokio::time::Instant::now();
            silence_deadline.as_mut().reset(now + period * 2);
            warning_deadline.as_mut().reset(now + period);
            warned = false;
        }};
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write_tx.send(tungstenite::Message::Close(None)).await;
                return LinkOutcome { confirmed, normal: true, cancelled: true };
            }

            () = &mut confirm_deadline, if !confirmed => {
                warn!(
                    timeout_secs = config.confirm_timeout.as_secs(),
                    "hub never confirmed the link"
                );
                advance(state, LinkEvent::ConfirmTimeout);
                return LinkOutcome { confirmed: false, normal: false, cancelled: false };
            }

            () = &mut silence_deadline, if confirmed => {
                warn!(period_secs = period.as_secs(), "two heartbeat intervals of silence, closing");
                advance(state, LinkEvent::SilenceTimeout);
                return LinkOutcome { confirmed: true, normal: false, cancelled: false };
            }

            () = &mut warning_deadline, if confirmed && !warned => {
                debug!("silent past one heartbeat interval, probing");
                warned = true;
                advance(state, LinkEvent::SilenceWarning);
                if let Err(e) = send_ping(write_tx).await {
                    warn!("probe send failed: {e}");
                    advance(state, LinkEvent::TransportClosed { normal: false });
                    return LinkOutcome { confirmed: true, normal: false, cancelled: false };
                }
            }

            _ = heartbeat.tick(), if confirmed => {
                if let Err(e) = send_ping(write_tx).await {
                    warn!("heartbeat send failed: {e}");
                    advance(state, LinkEvent::TransportClosed { normal: false });
                    return LinkOutcome { confirmed: true, normal: false, cancelled: false };
                }
            }

            changed = activity.changed() => {
                if changed.is_err() {
                    continue; // Activity handle dropped; keep current cadence.
                }
                let now_active = *activity.borrow();
                if now_active == active {
                    continue;
                }
                active = now_active;
                period = period_for(active, config.idle_heartbeat, config.active_heartbeat);
                heartbeat = tokio::time::interval(period);
                heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                heartbeat.tick().await;
                info!(active, period_secs = period.as_secs(), "heartbeat cadence changed");
                if active && confirmed {
                    // Out-of-band ping so the hub sees the device promptly.
                    let _ = send_ping(write_tx).await;
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        if let Some(outcome) = handle_frame(
                            msg,
                            &mut confirmed,
                            state,
                            on_command,
                            write_tx,
                        ).await {
                            return outcome;
                        }
                        reset_silence!();
                    }
                    Some(Err(e)) => {
                        warn!("read error: {e}");
                        advance(state, LinkEvent::TransportClosed { normal: false });
                        return LinkOutcome { confirmed, normal: false, cancelled: false };
                    }
                    None => {
                        debug!("stream ended");
                        advance(state, LinkEvent::TransportClosed { normal: false });
                        return LinkOutcome { confirmed, normal: false, cancelled: false };
                    }
                }
            }
        }
    }
}

/// Processes one frame. Returns `Some` when the link is over.
async fn handle_frame(
    msg: tungstenite::Message,
    confirmed: &mut bool,
    state: &mut LinkState,
    on_command: &CommandCallback,
    write_tx: &mpsc::Sender<tungstenite::Message>,
) -> Option<LinkOutcome> {
    match msg {
        tungstenite::Message::Text(text) => {
            // Only application frames confirm and heal the link;
            // transport pings prove the socket, not the hub.
            if !*confirmed {
                *confirmed = true;
                info!("link confirmed by hub");
            }
            advance(state, LinkEvent::FrameReceived);
            handle_text(&text, on_command, write_tx).await;
            None
        }
        tungstenite::Message::Ping(data) => {
            let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
            None
        }
        tungstenite::Message::Pong(_) => None,
        tungstenite::Message::Close(frame) => {
            let normal = frame.as_ref().is_none_or(|f| {
                u16::from(f.code) == 1000
            });
            if frame
                .as_ref()
                .is_some_and(|f| u16::from(f.code) == WS_CLOSE_SUPERSEDED)
            {
                warn!("hub closed this link: superseded by a newer connection");
            }
            advance(state, LinkEvent::TransportClosed { normal });
            Some(LinkOutcome {
                confirmed: *confirmed,
                normal,
                cancelled: false,
            })
        }
        _ => None, // Binary and raw frames ignored.
    }
}

async fn handle_text(
    text: &str,
    on_command: &CommandCallback,
    write_tx: &mpsc::Sender<tungstenite::Message>,
) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    match msg.msg_type {
        MessageType::DeviceStatusAck => {}

        MessageType::CommandDelivery => {
            let delivery: CommandDelivery = match msg.parse_payload() {
                Ok(Some(d)) => d,
                _ => {
                    warn!(id = %msg.id, "malformed command delivery");
                    return;
                }
            };
            // Ack first: the ack means "received", not "done".
            let ack = CommandAck {
                queue_id: delivery.queue_id.clone(),
            };
            if let Ok(reply) = msg.reply(MessageType::CommandAck, Some(&ack))
                && let Err(e) = send_envelope(write_tx, &reply).await
            {
                warn!(queue_id = %delivery.queue_id, "ack send failed: {e}");
            }
            info!(queue_id = %delivery.queue_id, command = %delivery.name, "command received");
            on_command(delivery);
        }

        MessageType::Ping => {
            let timestamp = msg
                .parse_payload::<PingPayload>()
                .ok()
                .flatten()
                .map(|p| p.timestamp)
                .unwrap_or_default();
            let pong = PongPayload {
                timestamp,
                server_time: Utc::now().timestamp_millis(),
            };
            if let Ok(reply) = msg.reply(MessageType::Pong, Some(&pong)) {
                let _ = send_envelope(write_tx, &reply).await;
            }
        }

        MessageType::Pong => {
            if let Ok(Some(pong)) = msg.parse_payload::<PongPayload>() {
                let rtt = Utc::now().timestamp_millis() - pong.timestamp;
                trace!(rtt_ms = rtt, "heartbeat round trip");
            }
        }

        MessageType::Error => {
            warn!(error = ?msg.error, "hub reported error");
        }

        MessageType::Unknown => {
            debug!("unknown message type ignored");
        }

        other => {
            debug!(msg_type = ?other, "unhandled message type");
        }
    }
}

async fn send_report(
    config: &AgentConfig,
    status: &Arc<dyn StatusSource>,
    write_tx: &mpsc::Sender<tungstenite::Message>,
) -> Result<(), AgentError> {
    let report = DeviceReport {
        device_id: config.device_id.clone(),
        name: config.name.clone(),
        attributes: status.attributes(),
        last_seen: None,
        last_heartbeat: None,
    };
    let msg = Message::new(
        uuid::Uuid::new_v4().to_string(),
        MessageType::DeviceStatus,
        Some(&report),
    )?;
    send_envelope(write_tx, &msg).await
}

async fn send_ping(write_tx: &mpsc::Sender<tungstenite::Message>) -> Result<(), AgentError> {
    let ping = PingPayload {
        timestamp: Utc::now().timestamp_millis(),
    };
    let msg = Message::new(
        uuid::Uuid::new_v4().to_string(),
        MessageType::Ping,
        Some(&ping),
    )?;
    send_envelope(write_tx, &msg).await
}

async fn send_envelope(
    write_tx: &mpsc::Sender<tungstenite::Message>,
    msg: &Message,
) -> Result<(), AgentError> {
    let json = serde_json::to_string(msg)?;
    write_tx
        .send(tungstenite::Message::Text(json.into()))
        .await
        .map_err(|_| AgentError::Closed)
}

/// Writes outbound frames until the channel or connection closes.
async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            warn!("write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = write.send(tungstenite::Message::Close(None)).await;
}
