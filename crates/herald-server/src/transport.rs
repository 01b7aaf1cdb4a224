//! [`Transport`] over the write half of an axum `WebSocket`.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use herald_core::envelope::decode_close;
use herald_core::{MessageKind, Transport, TransportError};
use tokio::sync::Mutex;

/// Frames engine envelopes onto a `WebSocket` sink.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl WsTransport {
    /// Wrap the write half of an upgraded socket.
    pub fn new(
        sink: SplitSink<WebSocket, Message>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            remote,
            local,
        }
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Map an engine frame onto a `WebSocket` message.
pub fn to_message(kind: MessageKind, payload: Bytes) -> Result<Message, TransportError> {
    Ok(match kind {
        MessageKind::Text => {
            let text = String::from_utf8(payload.to_vec()).map_err(|e| {
                TransportError::InvalidPayload {
                    kind,
                    reason: e.to_string(),
                }
            })?;
            Message::Text(text.into())
        }
        MessageKind::Binary => Message::Binary(payload),
        MessageKind::Ping => Message::Ping(payload),
        MessageKind::Close => Message::Close(decode_close(&payload).map(|(code, reason)| {
            CloseFrame {
                code,
                reason: reason.into(),
            }
        })),
    })
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), TransportError> {
        let message = to_message(kind, payload)?;
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        // Fails only when the peer is already gone.
        let _ = self.sink.lock().await.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
