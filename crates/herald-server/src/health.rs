//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while accepting sessions, `"draining"` once the hub has shut down.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sockets with a live read loop.
    pub connections: usize,
    /// Sessions registered with the hub.
    pub sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    accepting: bool,
    connections: usize,
    sessions: usize,
) -> HealthResponse {
    HealthResponse {
        status: if accepting { "ok" } else { "draining" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        sessions,
    }
}
