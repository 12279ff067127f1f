//! Bidirectional tunnels behind the WebSocket routes.
//!
//! Two flavors: raw byte splicing onto a TCP side port (VNC), and
//! message-level relaying onto an upstream WebSocket server (Playwright,
//! devtools). Both run until either side closes or the session's
//! cancellation token fires.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;

/// Splice a client WebSocket onto a raw TCP listener. Client frames are
/// written as bytes; upstream bytes come back as binary frames.
pub async fn ws_to_tcp(ws: WebSocket, addr: String, cancel: Option<CancellationToken>) {
    let upstream = match TcpStream::connect(&addr).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(addr = %addr, error = %err, "tunnel connection failed");
            return;
        }
    };
    let cancel = cancel.unwrap_or_default();
    let (mut tcp_read, mut tcp_write) = upstream.into_split();
    let (mut ws_write, mut ws_read) = ws.split();

    let client_to_upstream = async {
        while let Some(message) = ws_read.next().await {
            let payload = match message {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if tcp_write.write_all(&payload).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_write
                        .send(Message::Binary(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    tracing::info!(addr = %addr, "tunnel session closed");
}

/// Relay between a client WebSocket and an upstream WebSocket server.
pub async fn ws_to_ws(client: WebSocket, upstream_url: String, cancel: Option<CancellationToken>) {
    let (upstream, _) = match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::error!(url = %upstream_url, error = %err, "upstream websocket connect failed");
            return;
        }
    };
    let cancel = cancel.unwrap_or_default();
    let (mut up_write, mut up_read) = upstream.split();
    let (mut client_write, mut client_read) = client.split();

    let client_to_upstream = async {
        while let Some(message) = client_read.next().await {
            let mapped = match message {
                Ok(Message::Text(text)) => UpstreamMessage::Text(text),
                Ok(Message::Binary(bytes)) => UpstreamMessage::Binary(bytes),
                Ok(Message::Ping(payload)) => UpstreamMessage::Ping(payload),
                Ok(Message::Pong(payload)) => UpstreamMessage::Pong(payload),
                Ok(Message::Close(_)) | Err(_) => break,
            };
            if up_write.send(mapped).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(message) = up_read.next().await {
            let mapped = match message {
                Ok(UpstreamMessage::Text(text)) => Message::Text(text),
                Ok(UpstreamMessage::Binary(bytes)) => Message::Binary(bytes),
                Ok(UpstreamMessage::Ping(payload)) => Message::Ping(payload),
                Ok(UpstreamMessage::Pong(payload)) => Message::Pong(payload),
                Ok(UpstreamMessage::Close(_)) | Err(_) => break,
                Ok(UpstreamMessage::Frame(_)) => continue,
            };
            if client_write.send(mapped).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    tracing::info!(url = %upstream_url, "websocket relay closed");
}
