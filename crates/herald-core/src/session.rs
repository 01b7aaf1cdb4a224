//! One connected client: outbound queue, attribute store and the delivery
//! loop that is the sole writer to its transport.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::envelope::{Envelope, MessageKind};
use crate::errors::{HeraldError, Result};
use crate::handler::SessionHandler;
use crate::hub::WeakHub;
use crate::ids::{SessionId, SubscriberId};
use crate::options::HeraldOptions;
use crate::pubsub::{PubSub, Subscription};
use crate::transport::Transport;

type Queue = mpsc::Receiver<Arc<Envelope>>;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, not yet registered.
    Created,
    /// Registered with the hub; writes are accepted.
    Open,
    /// A close was requested; the delivery loop is winding down.
    Closing,
    /// The delivery loop has exited. Terminal.
    Closed,
}

/// Collaborators shared by every session of one [`crate::Herald`].
pub(crate) struct SessionContext {
    pub(crate) options: HeraldOptions,
    pub(crate) handler: Arc<dyn SessionHandler>,
    pub(crate) pubsub: PubSub,
    pub(crate) hub: WeakHub,
}

/// Receivers drained by the delivery loop, handed over when it starts.
pub(crate) struct Pump {
    outbound: Queue,
    subscription: Option<Subscription>,
}

/// Handle to a connected client.
///
/// Cheap to clone; all clones refer to the same session. Equality is by
/// [`SessionId`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: SessionId,
    state: Mutex<SessionState>,
    keys: RwLock<HashMap<String, Value>>,
    outbound: mpsc::Sender<Arc<Envelope>>,
    subscriber: Option<SubscriberId>,
    closing: CancellationToken,
    transport: Arc<dyn Transport>,
    context: Arc<SessionContext>,
}

enum Step {
    Continue,
    CloseSent,
}

enum Exit {
    Closing,
    CloseSent,
    Failed,
}

impl Session {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        keys: HashMap<String, Value>,
        subscription: Option<Subscription>,
        context: Arc<SessionContext>,
    ) -> (Self, Pump) {
        let (outbound, outbound_rx) = mpsc::channel(context.options.channel_buffer_size.max(1));
        let subscriber = subscription.as_ref().map(Subscription::id);
        let session = Self {
            inner: Arc::new(Inner {
                id: SessionId::new(),
                state: Mutex::new(SessionState::Created),
                keys: RwLock::new(keys),
                outbound,
                subscriber,
                closing: CancellationToken::new(),
                transport,
                context,
            }),
        };
        let pump = Pump {
            outbound: outbound_rx,
            subscription,
        };
        (session, pump)
    }

    /// Stable identifier.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Whether a close has been requested or completed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Resolves once a close has been requested.
    pub async fn closed(&self) {
        self.inner.closing.cancelled().await;
    }

    /// Peer address reported by the transport.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.remote_addr()
    }

    /// Local address reported by the transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Subscriber queue assigned by the pub/sub actor, if any.
    pub fn subscriber_id(&self) -> Option<SubscriberId> {
        self.inner.subscriber
    }

    /// Queue a text message.
    ///
    /// Never waits. When the outbound queue is full the message is dropped
    /// and [`HeraldError::BufferFull`] goes to the error hook; the call still
    /// succeeds.
    pub fn write(&self, text: impl Into<Bytes>) -> Result<()> {
        self.write_envelope(Envelope::text(text))
    }

    /// Queue a binary message. Same contract as [`Session::write`].
    pub fn write_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write_envelope(Envelope::binary(data))
    }

    /// Queue a close frame. The delivery loop stops writing once it is sent;
    /// the transport stays up until [`Session::close`].
    pub fn write_close(&self, code: u16, reason: &str) -> Result<()> {
        self.write_envelope(Envelope::close(code, reason))
    }

    fn write_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(HeraldError::SessionClosed);
        }
        let _ = self.offer(&Arc::new(envelope));
        Ok(())
    }

    /// Enqueue `envelope` if its filter selects this session.
    ///
    /// Returns whether the session matched. Failures, including a panic in
    /// the filter or in the error hook, are reported to the error hook and
    /// never reach the caller.
    pub(crate) fn offer(&self, envelope: &Arc<Envelope>) -> bool {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            if !envelope.matches(self) {
                return false;
            }
            self.enqueue(Arc::clone(envelope));
            true
        }));
        attempt.unwrap_or_else(|_| {
            warn!(session_id = %self.id(), "recovered from panic on outbound path");
            self.report(&HeraldError::WriteRecovered);
            false
        })
    }

    /// Enqueue `envelope` regardless of its filter.
    pub(crate) fn push(&self, envelope: &Arc<Envelope>) {
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
            self.enqueue(Arc::clone(envelope));
        }));
        if attempt.is_err() {
            warn!(session_id = %self.id(), "recovered from panic on outbound path");
            self.report(&HeraldError::WriteRecovered);
        }
    }

    fn enqueue(&self, envelope: Arc<Envelope>) {
        if self.is_closed() {
            self.report(&HeraldError::SessionClosed);
            return;
        }
        match self.inner.outbound.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %self.id(), "outbound queue full, message dropped");
                self.report(&HeraldError::BufferFull);
            }
            Err(TrySendError::Closed(_)) => self.report(&HeraldError::SessionClosed),
        }
    }

    fn report(&self, error: &HeraldError) {
        self.inner.context.handler.on_error(self, error);
    }

    /// Store an attribute.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let _ = self.inner.keys.write().insert(key.into(), value.into());
    }

    /// Read an attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.keys.read().get(key).cloned()
    }

    /// Remove an attribute.
    pub fn unset(&self, key: &str) {
        let _ = self.inner.keys.write().remove(key);
    }

    /// Snapshot of every attribute.
    pub fn keys(&self) -> HashMap<String, Value> {
        self.inner.keys.read().clone()
    }

    /// Subscribe this session's queue to more topics.
    ///
    /// Failures go to the error hook.
    pub async fn subscribe(&self, topics: &[&str]) {
        let Some(id) = self.inner.subscriber else {
            self.report(&HeraldError::NoSubscription {
                topics: topics.join(","),
            });
            return;
        };
        if let Err(error) = self.inner.context.pubsub.add_subscribe(id, topics).await {
            self.report(&error);
        }
    }

    /// Unsubscribe from `topics`, or from every topic when empty.
    ///
    /// Removing the last topic closes the subscriber queue, which ends the
    /// session. Failures go to the error hook.
    pub async fn unsubscribe(&self, topics: &[&str]) {
        let Some(id) = self.inner.subscriber else {
            self.report(&HeraldError::NoSubscription {
                topics: topics.join(","),
            });
            return;
        };
        if let Err(error) = self.inner.context.pubsub.unsubscribe(id, topics).await {
            self.report(&error);
        }
    }

    /// Topics this session is subscribed to.
    pub async fn topics(&self) -> Result<Vec<String>> {
        match self.inner.subscriber {
            Some(id) => self.inner.context.pubsub.topics_of(id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Request a close. Idempotent: only the first caller signals the
    /// delivery loop and releases the subscriber queue.
    ///
    /// The delivery loop flushes what is already queued, closes the
    /// transport and fires the disconnect hook.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.inner.closing.cancel();
        debug!(session_id = %self.id(), "session closing");

        if let Some(id) = self.inner.subscriber {
            if let Err(error) = self.inner.context.pubsub.release(id).await {
                debug!(session_id = %self.id(), %error, "subscriber queue not released");
            }
        }
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Created {
            *state = SessionState::Open;
        }
    }

    pub(crate) fn spawn(&self, pump: Pump) {
        drop(tokio::spawn(self.clone().run(pump)));
    }

    #[instrument(skip_all, fields(session_id = %self.inner.id))]
    async fn run(self, pump: Pump) {
        let Pump {
            mut outbound,
            mut subscription,
        } = pump;
        let period = self.inner.context.options.ping_period();
        let mut ping = time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let closing = self.inner.closing.clone();

        // Branches are polled in random order so no source starves another.
        let exit = loop {
            if closing.is_cancelled() {
                break Exit::Closing;
            }
            let step = tokio::select! {
                () = closing.cancelled() => break Exit::Closing,
                Some(envelope) = outbound.recv() => self.deliver(&envelope).await,
                published = recv_published(subscription.as_mut()) => match published {
                    Some(envelope) => self.deliver(&envelope).await,
                    None => {
                        debug!("subscriber queue closed");
                        break Exit::Closing;
                    }
                },
                _ = ping.tick() => self.deliver(&Envelope::ping()).await,
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::CloseSent) => break Exit::CloseSent,
                Err(error) => {
                    warn!(%error, "session write failed");
                    self.report(&error);
                    break Exit::Failed;
                }
            }
        };

        // Unblock any publisher waiting on this queue before anything else.
        drop(subscription);

        match exit {
            Exit::Closing => {
                self.close().await;
                self.flush(&mut outbound).await;
            }
            Exit::CloseSent => {
                drop(outbound);
                trace!("close frame sent, waiting for close");
                closing.cancelled().await;
            }
            Exit::Failed => self.close().await,
        }

        self.inner.transport.close().await;
        *self.inner.state.lock() = SessionState::Closed;
        if let Some(hub) = self.inner.context.hub.upgrade() {
            let _ = hub.unregister(self.id()).await;
        }
        self.inner.context.handler.on_disconnect(&self);
        debug!("session delivery loop exited");
    }

    /// Deliver what was queued before the close, stopping at the first
    /// failure or close frame.
    async fn flush(&self, outbound: &mut Queue) {
        while let Ok(envelope) = outbound.try_recv() {
            match self.deliver(&envelope).await {
                Ok(Step::Continue) => {}
                Ok(Step::CloseSent) => break,
                Err(error) => {
                    debug!(%error, "flush on close stopped");
                    break;
                }
            }
        }
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<Step> {
        let write_wait = self.inner.context.options.write_wait();
        let kind = envelope.kind();
        time::timeout(
            write_wait,
            self.inner.transport.send(kind, envelope.payload().clone()),
        )
        .await
        .map_err(|_| HeraldError::WriteTimeout(write_wait))??;

        let handler = &self.inner.context.handler;
        match kind {
            MessageKind::Close => return Ok(Step::CloseSent),
            MessageKind::Text => handler.on_sent(self, envelope.payload()),
            MessageKind::Binary => handler.on_sent_binary(self, envelope.payload()),
            MessageKind::Ping => {}
        }
        Ok(Step::Continue)
    }
}

async fn recv_published(subscription: Option<&mut Subscription>) -> Option<Arc<Envelope>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("subscriber", &self.inner.subscriber)
            .finish_non_exhaustive()
    }
}
