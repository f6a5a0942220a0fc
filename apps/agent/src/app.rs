//! Agent runtime: status source, command handling, session loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fleetlink_agent_client::{AgentSession, StatusSource};

use crate::config::Config;

/// Status attributes reported with every `device_status`.
///
/// The hub treats the attributes as opaque; this daemon reports the
/// basics every platform can answer.
struct HostStatus {
    version: &'static str,
}

impl StatusSource for HostStatus {
    fn attributes(&self) -> serde_json::Value {
        serde_json::json!({
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agent_version": self.version,
        })
    }
}

/// Runs the agent until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let session = AgentSession::new(
        config.session(),
        Arc::new(HostStatus {
            version: env!("CARGO_PKG_VERSION"),
        }),
        Box::new(|delivery| {
            // Command execution is platform-specific; the reference
            // daemon just records what arrived.
            tracing::info!(
                queue_id = %delivery.queue_id,
                command = %delivery.name,
                payload = %delivery.payload,
                "command received"
            );
        }),
    );

    let session_cancel = cancel.clone();
    let session_task = tokio::spawn(session.run(session_cancel));

    tracing::info!("agent ready");

    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    cancel.cancel();
    let _ = session_task.await;
    Ok(())
}
