//! HTTP polling fallback.
//!
//! A single hand-rolled endpoint, `GET /status`, returning the same
//! device snapshot observers get over WebSocket. For dashboards and
//! scripts that cannot hold a socket open; no framework, just enough
//! HTTP/1.1 to answer one request per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use fleetlink_protocol::messages::SnapshotResponse;

use crate::HubError;
use crate::hub::FleetHub;

/// Upper bound on the request head we bother reading.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Serves `GET /status` until cancellation. Returns the bound address
/// through `bound`, for callers that asked for port 0.
pub async fn serve_status(
    hub: Arc<FleetHub>,
    bind: SocketAddr,
    cancel: CancellationToken,
    bound: tokio::sync::oneshot::Sender<SocketAddr>,
) -> Result<(), HubError> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("status endpoint listening on http://{local_addr}/status");
    let _ = bound.send(local_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("status endpoint shutting down");
                return Ok(());
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => {
                        let hub = Arc::clone(&hub);
                        tokio::spawn(async move {
                            if let Err(e) = answer(hub, stream).await {
                                tracing::debug!("status request failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::error!("status accept error: {e}"),
                }
            }
        }
    }
}

async fn answer(hub: Arc<FleetHub>, mut stream: TcpStream) -> Result<(), HubError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    // Read until the end of the request head.
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            write_response(&mut stream, "400 Bad Request", "request too large").await?;
            return Ok(());
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());

    if method != "GET" {
        write_response(&mut stream, "405 Method Not Allowed", "only GET is supported").await?;
        return Ok(());
    }
    if path != "/status" {
        write_response(&mut stream, "404 Not Found", "unknown path").await?;
        return Ok(());
    }

    let snapshot = SnapshotResponse {
        devices: hub.snapshot().await,
    };
    let body = serde_json::to_string(&snapshot)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    body: &str,
) -> Result<(), HubError> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_store::MemoryStore;

    use crate::hub::HubTuning;

    async fn start() -> (SocketAddr, CancellationToken) {
        let hub = FleetHub::new(Arc::new(MemoryStore::new()), HubTuning::default());
        let cancel = CancellationToken::new();
        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            serve_status(hub, ([127, 0, 0, 1], 0).into(), task_cancel, bound_tx)
                .await
                .unwrap();
        });
        (bound_rx.await.unwrap(), cancel)
    }

    async fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn status_returns_snapshot_json() {
        let (addr, cancel) = start().await;
        let response = request(addr, "GET /status HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("application/json"));
        assert!(response.contains(r#""devices":[]"#));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (addr, cancel) = start().await;
        let response = request(addr, "GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn post_is_rejected() {
        let (addr, cancel) = start().await;
        let response = request(addr, "POST /status HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405"));
        cancel.cancel();
    }
}
