//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use herald_core::{Envelope, Herald, HeraldError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before giving up on tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code sent to every session when the server goes away.
pub const GOING_AWAY: u16 = 1001;

/// Coordinates the listener, background tasks and the engine on shutdown.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal every task holding a token.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut the engine down, then wait for tracked tasks.
    ///
    /// 1. Cancel the token (stops the listener and background tasks)
    /// 2. Send a going-away close to every session and stop the hub and actor
    /// 3. Wait up to `timeout` for all handles to complete
    pub async fn drain(
        &self,
        herald: &Herald,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let sessions = herald.session_count();
        match herald
            .shutdown(Envelope::close(GOING_AWAY, "server shutting down"))
            .await
        {
            Ok(()) => info!(sessions, "engine stopped"),
            Err(HeraldError::HubClosed) => {}
            Err(error) => warn!(%error, "engine shutdown failed"),
        }

        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );
        let tasks = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, tasks).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
