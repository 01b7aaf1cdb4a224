//! # herald-server
//!
//! Axum `WebSocket` embedding for [`herald_core`].
//!
//! - `WebSocket` upgrade route with origin check and a per-connection read loop
//! - [`transport::WsTransport`]: the engine's transport over an axum socket
//! - `/health` endpoint
//! - Configuration via figment (defaults, JSON file, `HERALD_*` env vars)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::{ServerConfig, load_config};
pub use errors::{ConfigError, ServerError};
pub use server::{HeraldServer, OriginCheck};
