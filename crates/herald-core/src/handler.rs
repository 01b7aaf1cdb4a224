//! Application callbacks.

use bytes::Bytes;

use crate::errors::HeraldError;
use crate::session::Session;

/// Hooks the embedding application implements.
///
/// Every method has a no-op default. Hooks run synchronously on the task that
/// raised the event (a delivery loop, the hub loop or the transport's read
/// loop), so they must not block; spawn a task for anything slow.
pub trait SessionHandler: Send + Sync + 'static {
    /// A session was registered and its delivery loop is about to start.
    fn on_connect(&self, _session: &Session) {}

    /// The session's delivery loop has exited. Fires exactly once.
    fn on_disconnect(&self, _session: &Session) {}

    /// The peer answered a keep-alive ping.
    fn on_pong(&self, _session: &Session) {}

    /// A text message arrived.
    fn on_message(&self, _session: &Session, _payload: Bytes) {}

    /// A binary message arrived.
    fn on_message_binary(&self, _session: &Session, _payload: Bytes) {}

    /// A text message was written to the transport.
    fn on_sent(&self, _session: &Session, _payload: &Bytes) {}

    /// A binary message was written to the transport.
    fn on_sent_binary(&self, _session: &Session, _payload: &Bytes) {}

    /// A per-session failure that was not returned to any caller.
    fn on_error(&self, _session: &Session, _error: &HeraldError) {}

    /// The peer sent a close frame.
    fn on_close(&self, _session: &Session, _code: u16, _reason: &str) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}
