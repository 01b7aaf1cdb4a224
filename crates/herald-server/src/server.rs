//! `HeraldServer`: axum router, upgrade admission and listener lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use futures::StreamExt;
use herald_core::{Herald, SessionHandler};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection::run_connection;
use crate::errors::ServerError;
use crate::health::{HealthResponse, health_check};
use crate::metrics::{WS_REJECTED_TOTAL, render};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::WsTransport;

/// Decides whether an upgrade with the given `Origin` header is allowed.
///
/// Without a check every origin is accepted.
pub type OriginCheck = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Session key holding the peer address as a string.
pub const REMOTE_ADDR_KEY: &str = "remote_addr";

/// Peer address captured by the admission middleware.
#[derive(Debug, Clone, Copy)]
struct PeerAddr(Option<SocketAddr>);

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    herald: Herald,
    origin_check: Option<OriginCheck>,
    start_time: Instant,
    local_addr: Option<SocketAddr>,
    pong_wait: Duration,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
}

/// The herald `WebSocket` server.
pub struct HeraldServer {
    config: ServerConfig,
    herald: Herald,
    shutdown: Arc<ShutdownCoordinator>,
    origin_check: Option<OriginCheck>,
    start_time: Instant,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
}

impl HeraldServer {
    /// Create a server and spawn its engine. Must run inside a Tokio runtime.
    pub fn new(config: ServerConfig, handler: impl SessionHandler) -> Self {
        let herald = Herald::new(config.options.clone(), handler);
        Self::with_herald(config, herald)
    }

    /// Serve an existing engine.
    pub fn with_herald(config: ServerConfig, herald: Herald) -> Self {
        Self {
            config,
            herald,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            origin_check: None,
            start_time: Instant::now(),
            connections: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    /// Serve Prometheus text from `handle` on `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Reject upgrades whose `Origin` header fails `check` with 403.
    #[must_use]
    pub fn with_origin_check<F>(mut self, check: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.origin_check = Some(Arc::new(check));
        self
    }

    /// The engine behind this server.
    pub fn herald(&self) -> &Herald {
        &self.herald
    }

    /// The configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shutdown coordinator. Cancelling its token stops the listener.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Build the router without a known local address.
    pub fn router(&self) -> Router {
        self.app(None)
    }

    fn app(&self, local_addr: Option<SocketAddr>) -> Router {
        let state = AppState {
            herald: self.herald.clone(),
            origin_check: self.origin_check.clone(),
            start_time: self.start_time,
            local_addr,
            pong_wait: self.config.options.pong_wait(),
            connections: Arc::clone(&self.connections),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(
                &self.config.path,
                get(ws_handler).route_layer(middleware::from_fn_with_state(state.clone(), admit)),
            )
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until the shutdown token fires.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let requested = self.config.bind_address();
        let addr: SocketAddr = requested
            .parse()
            .map_err(|source| ServerError::Address {
                addr: requested.clone(),
                source,
            })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        let app = self.app(Some(local));
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
            if let Err(error) = served {
                warn!(%error, "server exited with error");
            }
        });

        info!(addr = %local, path = %self.config.path, "herald server listening");
        Ok((local, handle))
    }
}

impl std::fmt::Debug for HeraldServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeraldServer")
            .field("config", &self.config)
            .field("origin_check", &self.origin_check.is_some())
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Refuse upgrades once the hub is closed or when the origin is not allowed.
async fn admit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if state.herald.is_closed() {
        counter!(WS_REJECTED_TOTAL, "reason" => "closed").increment(1);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(check) = &state.origin_check {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if !check(origin) {
            warn!(?origin, "websocket origin rejected");
            counter!(WS_REJECTED_TOTAL, "reason" => "origin").increment(1);
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let _ = request.extensions_mut().insert(PeerAddr(remote));
    next.run(request).await
}

async fn ws_handler(
    State(state): State<AppState>,
    Extension(PeerAddr(remote)): Extension<PeerAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, socket, remote))
}

async fn serve_socket(state: AppState, socket: WebSocket, remote: Option<SocketAddr>) {
    let (sink, stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink, remote, state.local_addr));

    let mut keys = HashMap::new();
    if let Some(addr) = remote {
        let _ = keys.insert(REMOTE_ADDR_KEY.to_owned(), Value::from(addr.to_string()));
    }

    let session = match state.herald.connect(transport, keys).await {
        Ok(session) => session,
        Err(error) => {
            warn!(%error, "session rejected after upgrade");
            return;
        }
    };

    let _ = state.connections.fetch_add(1, Ordering::Relaxed);
    run_connection(state.herald.clone(), session, stream, state.pong_wait).await;
    let _ = state.connections.fetch_sub(1, Ordering::Relaxed);
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(
        state.start_time,
        !state.herald.is_closed(),
        state.connections.load(Ordering::Relaxed),
        state.herald.session_count(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
