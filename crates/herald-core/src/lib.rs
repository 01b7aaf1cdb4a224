//! # herald-core
//!
//! Topic-based publish/subscribe broadcast engine over a pool of live
//! client sessions.
//!
//! - [`Hub`]: registry of open sessions, broadcast and grace-period eviction
//! - [`PubSub`]: single-owner actor over the topic index
//! - [`Session`]: one client, its outbound queue and its delivery loop
//! - [`Herald`]: facade wiring a [`SessionHandler`] to one hub and one actor
//!
//! The transport is pluggable through the [`Transport`] trait; the core never
//! touches sockets or frame encoding.

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod handler;
pub mod herald;
pub mod hub;
pub mod ids;
pub mod options;
pub mod pubsub;
mod register;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use envelope::{Envelope, Filter, MessageKind};
pub use errors::{HeraldError, Result};
pub use handler::{NoopHandler, SessionHandler};
pub use herald::Herald;
pub use hub::Hub;
pub use ids::{SessionId, SubscriberId};
pub use options::HeraldOptions;
pub use pubsub::{PubSub, Subscription};
pub use session::{Session, SessionState};
pub use transport::{InboundEvent, Transport, TransportError};
