//! Shared test fixtures: a recording transport, a recording handler and a
//! wired-up hub/actor pair.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::envelope::MessageKind;
use crate::errors::HeraldError;
use crate::handler::SessionHandler;
use crate::hub::Hub;
use crate::options::HeraldOptions;
use crate::pubsub::PubSub;
use crate::session::{Pump, Session, SessionContext};
use crate::transport::{Transport, TransportError};

#[derive(Default)]
pub(crate) struct MockTransport {
    sent: Mutex<Vec<(MessageKind, Bytes)>>,
    closes: AtomicUsize,
    fail: AtomicBool,
    stall: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockTransport {
    pub(crate) fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stall_sends(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// Make every later send take `delay`.
    pub(crate) fn delay_sends(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Text)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub(crate) fn count(&self, kind: MessageKind) -> usize {
        self.sent.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), TransportError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push((kind, payload));
        Ok(())
    }

    async fn close(&self) {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 9000)))
    }
}

#[derive(Default)]
pub(crate) struct RecordingHandler {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    pongs: AtomicUsize,
    sent: AtomicUsize,
    sent_binary: AtomicUsize,
    messages: Mutex<Vec<String>>,
    binary: Mutex<Vec<Bytes>>,
    errors: Mutex<Vec<String>>,
    closes: Mutex<Vec<(u16, String)>>,
}

impl RecordingHandler {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_binary(&self) -> usize {
        self.sent_binary.load(Ordering::SeqCst)
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub(crate) fn binary(&self) -> Vec<Bytes> {
        self.binary.lock().clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub(crate) fn closes(&self) -> Vec<(u16, String)> {
        self.closes.lock().clone()
    }
}

impl SessionHandler for RecordingHandler {
    fn on_connect(&self, _session: &Session) {
        let _ = self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _session: &Session) {
        let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pong(&self, _session: &Session) {
        let _ = self.pongs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, _session: &Session, payload: Bytes) {
        self.messages
            .lock()
            .push(String::from_utf8_lossy(&payload).into_owned());
    }

    fn on_message_binary(&self, _session: &Session, payload: Bytes) {
        self.binary.lock().push(payload);
    }

    fn on_sent(&self, _session: &Session, _payload: &Bytes) {
        let _ = self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sent_binary(&self, _session: &Session, _payload: &Bytes) {
        let _ = self.sent_binary.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _session: &Session, error: &HeraldError) {
        self.errors.lock().push(error.to_string());
    }

    fn on_close(&self, _session: &Session, code: u16, reason: &str) {
        self.closes.lock().push((code, reason.to_owned()));
    }
}

/// Hub, actor and handler wired the way [`crate::Herald`] wires them.
pub(crate) struct TestContext {
    pub(crate) hub: Hub,
    pub(crate) pubsub: PubSub,
    pub(crate) handler: Arc<RecordingHandler>,
    context: Arc<SessionContext>,
}

impl TestContext {
    pub(crate) fn new(options: HeraldOptions) -> Self {
        let options = options.normalized();
        let hub = Hub::spawn(options.command_buffer_size);
        let pubsub = PubSub::spawn(options.channel_buffer_size, options.command_buffer_size);
        let handler = Arc::new(RecordingHandler::default());
        let context = Arc::new(SessionContext {
            options,
            handler: Arc::clone(&handler) as Arc<dyn SessionHandler>,
            pubsub: pubsub.clone(),
            hub: hub.downgrade(),
        });
        Self {
            hub,
            pubsub,
            handler,
            context,
        }
    }

    /// Unregistered session with a fresh subscriber queue.
    pub(crate) async fn session(&self) -> (Session, Pump, Arc<MockTransport>) {
        let subscription = self.pubsub.subscribe(&[]).await.unwrap();
        let transport = Arc::new(MockTransport::default());
        let (session, pump) = Session::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            HashMap::new(),
            Some(subscription),
            Arc::clone(&self.context),
        );
        (session, pump, transport)
    }

    pub(crate) fn session_without_queue(&self) -> (Session, Pump, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let (session, pump) = Session::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            HashMap::new(),
            None,
            Arc::clone(&self.context),
        );
        (session, pump, transport)
    }

    /// Registered, open session with its delivery loop running.
    pub(crate) async fn open_session(&self) -> (Session, Arc<MockTransport>) {
        let (session, pump, transport) = self.session().await;
        self.hub.register(session.clone()).await.unwrap();
        session.mark_open();
        session.spawn(pump);
        (session, transport)
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}
