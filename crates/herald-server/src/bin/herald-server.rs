//! # herald-server
//!
//! Demo server: echoes every message back to its sender, subscribes each
//! session to two topics and publishes to them periodically.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use herald_core::{Herald, HeraldError, Session, SessionHandler};
use herald_server::logging::{LogFormat, init_subscriber};
use herald_server::metrics::install_recorder;
use herald_server::{HeraldServer, load_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TEXT_TOPIC: &str = "topic1";
const BINARY_TOPIC: &str = "topic2";
const PUBLISH_PERIOD: Duration = Duration::from_secs(5);

/// Herald pub/sub demo server.
#[derive(Parser, Debug)]
#[command(name = "herald-server", about = "Herald WebSocket pub/sub server")]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides configuration).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides configuration).
    #[arg(long)]
    port: Option<u16>,

    /// Default log filter (overrides configuration).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format, `compact` or `json` (overrides configuration).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

struct Echo;

impl SessionHandler for Echo {
    fn on_connect(&self, session: &Session) {
        info!(session_id = %session.id(), remote = ?session.remote_addr(), "session connected");
        let session = session.clone();
        drop(tokio::spawn(async move {
            session.subscribe(&[TEXT_TOPIC, BINARY_TOPIC]).await;
        }));
    }

    fn on_disconnect(&self, session: &Session) {
        info!(session_id = %session.id(), "session disconnected");
    }

    fn on_message(&self, session: &Session, payload: Bytes) {
        if let Err(error) = session.write(payload) {
            debug!(%error, "echo dropped");
        }
    }

    fn on_message_binary(&self, session: &Session, payload: Bytes) {
        if let Err(error) = session.write_binary(payload) {
            debug!(%error, "binary echo dropped");
        }
    }

    fn on_error(&self, session: &Session, error: &HeraldError) {
        warn!(session_id = %session.id(), %error, "session error");
    }
}

async fn publish_ticks(herald: Herald, token: CancellationToken) {
    let mut interval = tokio::time::interval(PUBLISH_PERIOD);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        tick += 1;
        let text = herald.try_publish_text(&[TEXT_TOPIC], format!("tick {tick}"));
        let binary = herald.try_publish_binary(&[BINARY_TOPIC], tick.to_be_bytes().to_vec());
        if let Err(error) = text.and(binary) {
            warn!(%error, "publish failed");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    let _ = init_subscriber(&config.log_level, config.log_format);

    let metrics = install_recorder().context("failed to install metrics recorder")?;

    let server = HeraldServer::new(config, Echo).with_metrics(metrics);
    let (addr, serving) = server.listen().await.context("failed to start server")?;
    info!(%addr, "herald server ready");

    let herald = server.herald().clone();
    let publisher = tokio::spawn(publish_ticks(herald.clone(), server.shutdown().token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");
    server
        .shutdown()
        .drain(&herald, vec![serving, publisher], None)
        .await;
    Ok(())
}
