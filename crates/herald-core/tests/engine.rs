//! End-to-end behaviour of the engine through its public API.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::{
    Envelope, Herald, HeraldError, HeraldOptions, MessageKind, PubSub, Session, SessionHandler,
    SessionState, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Default)]
struct Wire {
    frames: Mutex<Vec<(MessageKind, Bytes)>>,
    closes: AtomicUsize,
}

impl Wire {
    fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == MessageKind::Text)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Wire {
    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), TransportError> {
        self.frames.lock().push((kind, payload));
        Ok(())
    }

    async fn close(&self) {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Errors {
    seen: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl SessionHandler for Errors {
    fn on_error(&self, _session: &Session, error: &HeraldError) {
        self.seen.lock().push(error.to_string());
    }

    fn on_disconnect(&self, _session: &Session) {
        let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn engine(options: HeraldOptions) -> (Herald, Arc<Errors>) {
    let handler = Arc::new(Errors::default());
    let herald = Herald::with_handler(options, Arc::clone(&handler) as Arc<dyn SessionHandler>);
    (herald, handler)
}

async fn connect(herald: &Herald) -> (Session, Arc<Wire>) {
    let wire = Arc::new(Wire::default());
    let session = herald
        .connect(Arc::clone(&wire) as Arc<dyn Transport>, HashMap::new())
        .await
        .unwrap();
    (session, wire)
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn filtered_broadcast_reaches_only_selected_session() {
    let (herald, _) = engine(HeraldOptions::default());
    let (_a, a_wire) = connect(&herald).await;
    let (b, b_wire) = connect(&herald).await;
    let (_c, c_wire) = connect(&herald).await;
    b.set("role", "admin");

    herald
        .broadcast_filter("secret", |s| s.get("role").is_some_and(|r| r == "admin"))
        .await
        .unwrap();
    herald.broadcast("marker").await.unwrap();

    let marker = ["marker".to_string()];
    eventually(|| {
        [&a_wire, &b_wire, &c_wire]
            .iter()
            .all(|w| w.texts().ends_with(&marker))
    })
    .await;
    assert_eq!(b_wire.texts(), vec!["secret", "marker"]);
    assert_eq!(a_wire.texts(), vec!["marker"]);
    assert_eq!(c_wire.texts(), vec!["marker"]);
}

#[tokio::test]
async fn concurrent_closes_tear_down_once() {
    let (herald, handler) = engine(HeraldOptions::default());
    let (session, wire) = connect(&herald).await;
    session.subscribe(&["t"]).await;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.close().await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    eventually(|| session.state() == SessionState::Closed).await;
    eventually(|| herald.session_count() == 0).await;
    assert_eq!(wire.closes(), 1);
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    assert!(herald.pubsub().subscribers_of("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn closed_queue_is_never_reused() {
    let pubsub = PubSub::spawn(4, 16);
    let mut sub = pubsub.subscribe(&["t"]).await.unwrap();
    pubsub.unsubscribe(sub.id(), &["t"]).await.unwrap();

    assert_eq!(pubsub.publish(&["t"], Envelope::text("x")).await.unwrap(), 0);
    assert!(sub.recv().await.is_none());
    assert!(matches!(
        pubsub.add_subscribe(sub.id(), &["t"]).await,
        Err(HeraldError::QueueClosed(_))
    ));
}

#[tokio::test]
async fn blocking_and_best_effort_publish_under_pressure() {
    let pubsub = PubSub::spawn(1, 16);
    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(pubsub.subscribe(&["t"]).await.unwrap());
    }
    assert_eq!(pubsub.publish(&["t"], Envelope::text("fill")).await.unwrap(), 3);

    pubsub.try_publish(&["t"], Envelope::text("dropped")).unwrap();

    let publisher = pubsub.clone();
    let blocked =
        tokio::spawn(async move { publisher.publish(&["t"], Envelope::text("kept")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let first = subs[0].recv().await.unwrap();
    assert_eq!(first.payload(), "fill");
    for sub in &mut subs[1..] {
        assert_eq!(sub.recv().await.unwrap().payload(), "fill");
    }
    assert_eq!(blocked.await.unwrap().unwrap(), 3);
    for sub in &mut subs {
        assert_eq!(sub.recv().await.unwrap().payload(), "kept");
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
    }
}

#[tokio::test]
async fn unicast_overflow_reports_buffer_full() {
    let (herald, handler) = engine(HeraldOptions {
        channel_buffer_size: 1,
        ..HeraldOptions::default()
    });
    let (session, wire) = connect(&herald).await;

    // The delivery loop may drain between writes, so keep writing until the
    // queue overflows at least once.
    for i in 0..64 {
        session.write(format!("m{i}")).unwrap();
    }
    eventually(|| !handler.seen.lock().is_empty()).await;
    assert!(
        handler
            .seen
            .lock()
            .iter()
            .all(|e| e == "session message buffer is full")
    );
    eventually(|| wire.texts().first().map(String::as_str) == Some("m0")).await;
}

#[tokio::test(start_paused = true)]
async fn close_sessions_defers_transport_close() {
    let (herald, _) = engine(HeraldOptions {
        close_grace_ms: 1_000,
        ..HeraldOptions::default()
    });
    let (session, wire) = connect(&herald).await;
    let started = tokio::time::Instant::now();

    herald
        .close_sessions(Envelope::close(4000, "maintenance"))
        .await
        .unwrap();
    eventually(|| wire.frames.lock().iter().any(|(k, _)| *k == MessageKind::Close)).await;
    assert_eq!(wire.closes(), 0);

    eventually(|| wire.closes() == 1).await;
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    eventually(|| session.state() == SessionState::Closed).await;
}

#[tokio::test]
async fn shutdown_is_final() {
    let (herald, _) = engine(HeraldOptions::default());
    let (_session, wire) = connect(&herald).await;

    herald.shutdown(Envelope::close(1001, "bye")).await.unwrap();
    eventually(|| wire.closes() == 1).await;
    assert_eq!(herald.session_count(), 0);

    let late = Arc::new(Wire::default());
    assert!(matches!(
        herald
            .connect(Arc::clone(&late) as Arc<dyn Transport>, HashMap::new())
            .await,
        Err(HeraldError::HubClosed)
    ));
    assert!(matches!(
        herald.shutdown(Envelope::close(1000, "")).await,
        Err(HeraldError::HubClosed)
    ));
}
