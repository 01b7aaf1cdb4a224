//! Seam between the engine and the wire protocol.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::envelope::MessageKind;

/// Failures reported by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is already closed.
    #[error("transport connection is closed")]
    Closed,

    /// The payload cannot be framed as the requested kind.
    #[error("invalid payload for {kind:?} frame: {reason}")]
    InvalidPayload {
        /// Requested frame kind.
        kind: MessageKind,
        /// Why the payload was rejected.
        reason: String,
    },

    /// The underlying connection failed.
    #[error("transport send failed: {0}")]
    Send(String),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outbound half of a client connection.
///
/// A session's delivery loop is the only caller of [`Transport::send`], so
/// implementations need not support concurrent writers beyond the final
/// [`Transport::close`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one frame.
    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), TransportError>;

    /// Tear the connection down. Called once per session.
    async fn close(&self);

    /// Peer address, when known.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Local address, when known.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Events the transport's read side feeds into [`crate::Herald::handle_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Text frame.
    Text(Bytes),
    /// Binary frame.
    Binary(Bytes),
    /// Pong frame.
    Pong,
    /// Close frame from the peer.
    Close {
        /// Status code (1005 when absent).
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The read side ended: peer gone, read deadline hit or protocol error.
    Disconnected,
}
