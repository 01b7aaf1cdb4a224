//! Error taxonomy for the broadcast engine.

use std::time::Duration;

use thiserror::Error;

use crate::ids::SubscriberId;
use crate::transport::TransportError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, HeraldError>;

/// Errors surfaced by the hub, the pub/sub actor and sessions.
#[derive(Debug, Error)]
pub enum HeraldError {
    /// The hub has been shut down.
    #[error("hub is closed")]
    HubClosed,

    /// The pub/sub actor has been shut down.
    #[error("pub/sub service is closed")]
    PubSubClosed,

    /// The session is closing or closed.
    #[error("tried to write to a closed session")]
    SessionClosed,

    /// The session's outbound queue is full; the message was dropped.
    #[error("session message buffer is full")]
    BufferFull,

    /// A panic on the outbound path was caught and converted.
    #[error("recovered from a panic while writing to a session")]
    WriteRecovered,

    /// Subscription management on a session that never got a queue.
    #[error("session has no subscription queue (topics: {topics})")]
    NoSubscription {
        /// Comma-separated topics of the rejected request.
        topics: String,
    },

    /// The subscriber queue was closed; re-subscribing requires a new queue.
    #[error("subscriber queue {0} is closed")]
    QueueClosed(SubscriberId),

    /// The transport did not accept a frame within the write deadline.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The transport rejected a frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HeraldError {
    /// Whether the error means the target resource is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::HubClosed | Self::PubSubClosed | Self::SessionClosed | Self::QueueClosed(_)
        )
    }
}
