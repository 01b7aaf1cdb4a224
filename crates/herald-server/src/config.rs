//! Server configuration.
//!
//! Layers, lowest precedence first: compiled defaults, an optional JSON file,
//! then `HERALD_*` environment variables (`__` separates nested keys, e.g.
//! `HERALD_OPTIONS__CLOSE_GRACE_MS=500`).

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use herald_core::HeraldOptions;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::logging::LogFormat;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HERALD_";

/// Listener, routing and engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (0 = OS-assigned).
    pub port: u16,
    /// Route serving the `WebSocket` upgrade.
    pub path: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Stderr log format.
    pub log_format: LogFormat,
    /// Engine tunables.
    pub options: HeraldOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8888,
            path: "/ws".into(),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            options: HeraldOptions::default(),
        }
    }
}

impl ServerConfig {
    /// `host:port` as configured.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The layered figment behind [`load_config`].
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Json::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load configuration from defaults, `path` and the environment.
///
/// A `path` that does not exist is an error; omit it to skip the file layer.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    if let Some(missing) = path.filter(|p| !p.exists()) {
        return Err(ConfigError::NotFound(missing.to_path_buf()));
    }
    let mut config: ServerConfig = figment(path).extract().map_err(Box::new)?;
    config.options = config.options.normalized();
    Ok(config)
}
