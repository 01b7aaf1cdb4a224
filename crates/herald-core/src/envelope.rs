//! The immutable unit of delivery shared by the hub, the pub/sub actor and
//! session delivery loops.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::session::Session;

/// Frame kind carried by an [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Keep-alive ping.
    Ping,
    /// Close frame; delivering it ends the session's delivery loop.
    Close,
}

/// Recipient predicate evaluated per session at fan-out time.
pub type Filter = Arc<dyn Fn(&Session) -> bool + Send + Sync>;

/// Message kind, payload and an optional recipient filter.
///
/// Envelopes are wrapped in an `Arc` once they enter a queue and are then
/// read concurrently by every recipient.
#[derive(Clone)]
pub struct Envelope {
    kind: MessageKind,
    payload: Bytes,
    filter: Option<Filter>,
}

impl Envelope {
    /// Build an envelope of any kind.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            filter: None,
        }
    }

    /// Text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Text, payload)
    }

    /// Binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload)
    }

    /// Zero-payload keep-alive ping.
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Bytes::new())
    }

    /// Close message: big-endian status code followed by the UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self::new(MessageKind::Close, buf.freeze())
    }

    /// Restrict delivery to sessions for which `filter` returns `true`.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Frame kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether a recipient filter is attached.
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Whether `session` is a recipient of this envelope.
    pub fn matches(&self, session: &Session) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(session))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Split a close payload into its status code and reason.
///
/// Returns `None` for an empty payload (close without status).
pub fn decode_close(payload: &[u8]) -> Option<(u16, String)> {
    let (code, reason) = payload.split_first_chunk::<2>()?;
    Some((
        u16::from_be_bytes(*code),
        String::from_utf8_lossy(reason).into_owned(),
    ))
}
