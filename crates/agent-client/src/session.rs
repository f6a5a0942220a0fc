//! Long-running agent session: reconnect loop around [`run_link`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetlink_lifecycle::{BackoffConfig, LinkEvent, LinkState, ReconnectDelay, ReconnectSchedule};
use fleetlink_protocol::constants::{
    AGENT_ACTIVE_HEARTBEAT, AGENT_IDLE_HEARTBEAT, CONFIRM_TIMEOUT,
};
use fleetlink_protocol::messages::CommandDelivery;

use crate::client::{advance, run_link};
use crate::heartbeat::ActivityHandle;
use crate::StatusSource;

/// Invoked for each command the hub delivers. Delivery acks mean
/// "received", so handlers must tolerate replays after a reconnect.
pub type CommandCallback = Box<dyn Fn(CommandDelivery) + Send + Sync>;

/// Settings for one agent session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket URL of the hub, e.g. `ws://hub.local:9300`.
    pub hub_url: String,
    /// Stable identity this device claims on every connection.
    pub device_id: String,
    /// Human-readable device name.
    pub name: String,
    /// Heartbeat period while the device is idle.
    pub idle_heartbeat: Duration,
    /// Heartbeat period while the device is actively in use.
    pub active_heartbeat: Duration,
    /// How long to wait for the hub's first frame before redialing.
    pub confirm_timeout: Duration,
    /// Reconnect pacing.
    pub backoff: BackoffConfig,
}

impl AgentConfig {
    pub fn new(
        hub_url: impl Into<String>,
        device_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            hub_url: hub_url.into(),
            device_id: device_id.into(),
            name: name.into(),
            idle_heartbeat: AGENT_IDLE_HEARTBEAT,
            active_heartbeat: AGENT_ACTIVE_HEARTBEAT,
            confirm_timeout: CONFIRM_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// A device-side session that keeps one link to the hub alive,
/// redialing with backoff whenever the link drops.
pub struct AgentSession {
    config: AgentConfig,
    status: Arc<dyn StatusSource>,
    on_command: CommandCallback,
    activity: ActivityHandle,
    activity_rx: watch::Receiver<bool>,
}

impl AgentSession {
    pub fn new(
        config: AgentConfig,
        status: Arc<dyn StatusSource>,
        on_command: CommandCallback,
    ) -> Self {
        let (activity, activity_rx) = ActivityHandle::new();
        Self {
            config,
            status,
            on_command,
            activity,
            activity_rx,
        }
    }

    /// Handle for flipping the session between idle and active cadence.
    pub fn activity_handle(&self) -> ActivityHandle {
        self.activity.clone()
    }

    /// Runs until cancelled. Never gives up on its own: once the
    /// backoff ladder is exhausted it keeps retrying at the cooldown
    /// interval.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut state = LinkState::Idle;
        let mut schedule = ReconnectSchedule::new(self.config.backoff.clone());

        info!(
            url = %self.config.hub_url,
            device_id = %self.config.device_id,
            "agent session starting"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match state {
                LinkState::Backoff => advance(&mut state, LinkEvent::BackoffElapsed),
                LinkState::Connecting => {}
                _ => advance(&mut state, LinkEvent::DialStarted),
            }

            let attempt = schedule.attempt();
            if attempt > 1 {
                info!(attempt, "redialing hub");
            }

            let outcome = run_link(
                &self.config,
                &self.status,
                &mut self.activity_rx,
                &self.on_command,
                &mut state,
                &cancel,
            )
            .await;

            if outcome.cancelled {
                break;
            }
            if outcome.confirmed {
                schedule.confirm();
            }
            if outcome.normal {
                info!("hub closed the link cleanly");
            }

            let delay = schedule.next_delay();
            match delay {
                ReconnectDelay::Step(d) => {
                    info!(delay_secs = d.as_secs(), "link down, redialing after backoff");
                }
                ReconnectDelay::Cooldown(d) => {
                    warn!(
                        cooldown_secs = d.as_secs(),
                        "attempt ceiling reached, cooling down"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay.duration()) => {}
            }
        }

        info!("agent session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite;

    use fleetlink_protocol::constants::MessageType;
    use fleetlink_protocol::envelope::Message;
    use fleetlink_protocol::messages::DeviceReport;

    struct FixedStatus;

    impl StatusSource for FixedStatus {
        fn attributes(&self) -> serde_json::Value {
            serde_json::json!({"battery": 77})
        }
    }

    fn test_config(port: u16) -> AgentConfig {
        let mut config = AgentConfig::new(
            format!("ws://127.0.0.1:{port}"),
            "device-1",
            "Test device",
        );
        config.idle_heartbeat = Duration::from_millis(50);
        config.active_heartbeat = Duration::from_millis(20);
        config.confirm_timeout = Duration::from_millis(200);
        config.backoff = BackoffConfig {
            steps: vec![Duration::from_millis(10)],
            min_interval: Duration::from_millis(10),
            max_attempts: 20,
            cooldown: Duration::from_millis(50),
        };
        config
    }

    async fn accept_ws(
        listener: &TcpListener,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn recv_envelope(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Message {
        loop {
            match ws.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => {
                    return serde_json::from_str(&text).unwrap();
                }
                tungstenite::Message::Ping(data) => {
                    ws.send(tungstenite::Message::Pong(data)).await.unwrap();
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn session_reports_status_and_heartbeats_after_confirm() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = AgentSession::new(
            test_config(port),
            Arc::new(FixedStatus),
            Box::new(|_| {}),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        let mut ws = accept_ws(&listener).await;
        let msg = recv_envelope(&mut ws).await;
        assert_eq!(msg.msg_type, MessageType::DeviceStatus);
        let report: DeviceReport = msg.parse_payload().unwrap().unwrap();
        assert_eq!(report.device_id, "device-1");
        assert_eq!(report.attributes["battery"], 77);

        // Any reply confirms the link; heartbeats follow.
        let ack = msg
            .reply(MessageType::DeviceStatusAck, Option::<&()>::None)
            .unwrap();
        ws.send(tungstenite::Message::Text(
            serde_json::to_string(&ack).unwrap().into(),
        ))
        .await
        .unwrap();

        let ping = recv_envelope(&mut ws).await;
        assert_eq!(ping.msg_type, MessageType::Ping);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unconfirmed_link_is_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = AgentSession::new(
            test_config(port),
            Arc::new(FixedStatus),
            Box::new(|_| {}),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        // Accept but stay silent; confirm_timeout forces a redial.
        let mut first = accept_ws(&listener).await;
        let status = recv_envelope(&mut first).await;
        assert_eq!(status.msg_type, MessageType::DeviceStatus);

        // Second dial proves the session retried.
        let mut second = accept_ws(&listener).await;
        let again = recv_envelope(&mut second).await;
        assert_eq!(again.msg_type, MessageType::DeviceStatus);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn delivered_commands_reach_callback_and_get_acked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let received = Arc::new(AtomicU32::new(0));
        let counter = received.clone();
        let session = AgentSession::new(
            test_config(port),
            Arc::new(FixedStatus),
            Box::new(move |delivery| {
                assert_eq!(delivery.name, "reboot");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        let mut ws = accept_ws(&listener).await;
        let status = recv_envelope(&mut ws).await;
        let ack = status
            .reply(MessageType::DeviceStatusAck, Option::<&()>::None)
            .unwrap();
        ws.send(tungstenite::Message::Text(
            serde_json::to_string(&ack).unwrap().into(),
        ))
        .await
        .unwrap();

        let delivery = fleetlink_protocol::messages::CommandDelivery {
            queue_id: "q-1".into(),
            name: "reboot".into(),
            payload: serde_json::Value::Null,
        };
        let msg = Message::new("cmd-msg-1", MessageType::CommandDelivery, Some(&delivery)).unwrap();
        ws.send(tungstenite::Message::Text(
            serde_json::to_string(&msg).unwrap().into(),
        ))
        .await
        .unwrap();

        // Ack comes back on the same envelope id.
        let reply = recv_envelope(&mut ws).await;
        assert_eq!(reply.msg_type, MessageType::CommandAck);
        assert_eq!(reply.id, "cmd-msg-1");
        let ack: fleetlink_protocol::messages::CommandAck =
            reply.parse_payload().unwrap().unwrap();
        assert_eq!(ack.queue_id, "q-1");
        assert_eq!(received.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn active_cadence_pings_faster() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = AgentSession::new(
            test_config(port),
            Arc::new(FixedStatus),
            Box::new(|_| {}),
        );
        let activity = session.activity_handle();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session.run(cancel.clone()));

        let mut ws = accept_ws(&listener).await;
        let status = recv_envelope(&mut ws).await;
        let ack = status
            .reply(MessageType::DeviceStatusAck, Option::<&()>::None)
            .unwrap();
        ws.send(tungstenite::Message::Text(
            serde_json::to_string(&ack).unwrap().into(),
        ))
        .await
        .unwrap();

        activity.set_active(true);

        // The idle-to-active edge sends an out-of-band ping almost
        // immediately, well inside the 50ms idle period.
        let started = std::time::Instant::now();
        let ping = recv_envelope(&mut ws).await;
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert!(started.elapsed() < Duration::from_millis(40));

        cancel.cancel();
        handle.await.unwrap();
    }
}
