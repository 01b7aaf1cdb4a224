//! Registry of open sessions.
//!
//! Every mutation is a command on the hub's serial loop. The session set
//! itself sits behind a reader/writer lock so snapshots and broadcasts read
//! it while registration takes the write side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::envelope::Envelope;
use crate::errors::{HeraldError, Result};
use crate::ids::SessionId;
use crate::session::Session;

enum Command {
    Register {
        session: Session,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister(SessionId),
    Broadcast(Arc<Envelope>),
    CloseSessions {
        envelope: Arc<Envelope>,
        grace: Duration,
    },
    Shutdown {
        envelope: Arc<Envelope>,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct HubState {
    sessions: RwLock<HashMap<SessionId, Session>>,
    open: AtomicBool,
}

/// Handle to the hub loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    state: Arc<HubState>,
}

/// Non-owning hub handle held by sessions, so live sessions do not keep
/// the hub loop running.
#[derive(Clone)]
pub(crate) struct WeakHub {
    commands: mpsc::WeakSender<Command>,
    state: Weak<HubState>,
}

impl WeakHub {
    pub(crate) fn upgrade(&self) -> Option<Hub> {
        Some(Hub {
            commands: self.commands.upgrade()?,
            state: self.state.upgrade()?,
        })
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("sessions", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Hub {
    /// Spawn the hub loop on the current runtime.
    pub fn spawn(command_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(command_capacity.max(1));
        let state = Arc::new(HubState {
            sessions: RwLock::new(HashMap::new()),
            open: AtomicBool::new(true),
        });
        drop(tokio::spawn(run(Arc::clone(&state), rx)));
        Self {
            commands: tx,
            state,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakHub {
        WeakHub {
            commands: self.commands.downgrade(),
            state: Arc::downgrade(&self.state),
        }
    }

    /// Add a session. Registering the same session twice is a no-op.
    pub async fn register(&self, session: Session) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { session, reply }).await?;
        rx.await.map_err(|_| HeraldError::HubClosed)?
    }

    /// Remove a session if present.
    pub async fn unregister(&self, id: &SessionId) -> Result<()> {
        self.send(Command::Unregister(id.clone())).await
    }

    /// Queue `envelope` on every member its filter selects.
    ///
    /// Per-member failures go to the error hook, never to the caller.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send(Command::Broadcast(Arc::new(envelope))).await
    }

    /// Like [`Hub::broadcast`], then force-close every matched member once
    /// `grace` has elapsed.
    pub async fn close_sessions(&self, envelope: Envelope, grace: Duration) -> Result<()> {
        self.send(Command::CloseSessions {
            envelope: Arc::new(envelope),
            grace,
        })
        .await
    }

    /// Write `envelope` to every member, evict and close them all, and
    /// close the hub. Irreversible.
    pub async fn shutdown(&self, envelope: Envelope) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown {
            envelope: Arc::new(envelope),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HeraldError::HubClosed)?
    }

    /// Snapshot of the current members.
    pub fn sessions(&self) -> Vec<Session> {
        self.state.sessions.read().values().cloned().collect()
    }

    /// Number of current members.
    pub fn len(&self) -> usize {
        self.state.sessions.read().len()
    }

    /// Whether the hub has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the hub has shut down.
    pub fn is_closed(&self) -> bool {
        !self.state.open.load(Ordering::Acquire)
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(HeraldError::HubClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| HeraldError::HubClosed)
    }
}

async fn run(state: Arc<HubState>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { session, reply } => {
                let _ = state
                    .sessions
                    .write()
                    .entry(session.id().clone())
                    .or_insert(session);
                let _ = reply.send(Ok(()));
            }
            Command::Unregister(id) => {
                if state.sessions.write().remove(&id).is_some() {
                    trace!(session_id = %id, "session unregistered");
                }
            }
            Command::Broadcast(envelope) => {
                let sessions = state.sessions.read();
                let recipients = sessions
                    .values()
                    .filter(|session| session.offer(&envelope))
                    .count();
                trace!(recipients, kind = ?envelope.kind(), "broadcast");
            }
            Command::CloseSessions { envelope, grace } => {
                let sessions = state.sessions.read();
                let mut matched = 0usize;
                for session in sessions.values() {
                    if session.offer(&envelope) {
                        matched += 1;
                        let session = session.clone();
                        drop(tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            session.close().await;
                        }));
                    }
                }
                debug!(matched, ?grace, "sessions scheduled for close");
            }
            Command::Shutdown { envelope, reply } => {
                shutdown(&state, &envelope).await;
                commands.close();
                while let Some(pending) = commands.recv().await {
                    match pending {
                        Command::Register { reply, .. } | Command::Shutdown { reply, .. } => {
                            let _ = reply.send(Err(HeraldError::HubClosed));
                        }
                        Command::Unregister(_)
                        | Command::Broadcast(_)
                        | Command::CloseSessions { .. } => {}
                    }
                }
                let _ = reply.send(Ok(()));
                return;
            }
        }
    }
}

async fn shutdown(state: &HubState, envelope: &Arc<Envelope>) {
    let evicted: Vec<Session> = {
        let mut sessions = state.sessions.write();
        state.open.store(false, Ordering::Release);
        sessions.drain().map(|(_, session)| session).collect()
    };
    info!(sessions = evicted.len(), "hub shutting down");
    for session in &evicted {
        session.push(envelope);
        session.close().await;
    }
}
