//! Prometheus recorder and the metric names recorded by the server.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before any metric is recorded. The returned handle
/// renders the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from `handle`.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Counter: `WebSocket` upgrades that became sessions.
pub const WS_CONNECTIONS_TOTAL: &str = "herald_ws_connections_total";
/// Counter: sessions whose read loop has ended.
pub const WS_DISCONNECTIONS_TOTAL: &str = "herald_ws_disconnections_total";
/// Gauge: sockets with a live read loop.
pub const WS_CONNECTIONS_ACTIVE: &str = "herald_ws_connections_active";
/// Counter: upgrade requests refused, labelled by `reason`.
pub const WS_REJECTED_TOTAL: &str = "herald_ws_rejected_total";
/// Counter: inbound frames, labelled by `kind`.
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "herald_ws_frames_received_total";
