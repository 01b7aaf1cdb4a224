//! Facade: one hub, one pub/sub actor and the application's handler.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info};

use crate::envelope::Envelope;
use crate::errors::{HeraldError, Result};
use crate::handler::SessionHandler;
use crate::hub::Hub;
use crate::options::HeraldOptions;
use crate::pubsub::PubSub;
use crate::session::{Session, SessionContext};
use crate::transport::{InboundEvent, Transport};

/// Entry point for embedding applications.
///
/// Cloning is cheap and every clone drives the same hub and actor.
#[derive(Clone)]
pub struct Herald {
    hub: Hub,
    pubsub: PubSub,
    context: Arc<SessionContext>,
}

impl std::fmt::Debug for Herald {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Herald")
            .field("options", &self.context.options)
            .field("hub", &self.hub)
            .field("pubsub", &self.pubsub)
            .finish_non_exhaustive()
    }
}

impl Herald {
    /// Spawn the hub loop and the pub/sub actor on the current runtime.
    ///
    /// Zero-valued options fall back to their defaults.
    pub fn new(options: HeraldOptions, handler: impl SessionHandler) -> Self {
        Self::with_handler(options, Arc::new(handler))
    }

    /// Like [`Herald::new`] with a shared handler.
    pub fn with_handler(options: HeraldOptions, handler: Arc<dyn SessionHandler>) -> Self {
        let options = options.normalized();
        let hub = Hub::spawn(options.command_buffer_size);
        let pubsub = PubSub::spawn(options.channel_buffer_size, options.command_buffer_size);
        let context = Arc::new(SessionContext {
            options,
            handler,
            pubsub: pubsub.clone(),
            hub: hub.downgrade(),
        });
        Self {
            hub,
            pubsub,
            context,
        }
    }

    /// Effective options.
    pub fn options(&self) -> &HeraldOptions {
        &self.context.options
    }

    /// The session registry.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// The pub/sub actor.
    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Adopt an established connection.
    ///
    /// Seeds the attribute store with `keys`, assigns a fresh subscriber
    /// queue, registers the session, fires the connect hook and starts the
    /// delivery loop. On failure the transport is closed.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        keys: HashMap<String, Value>,
    ) -> Result<Session> {
        if self.hub.is_closed() {
            transport.close().await;
            return Err(HeraldError::HubClosed);
        }
        let subscription = match self.pubsub.subscribe(&[]).await {
            Ok(subscription) => subscription,
            Err(error) => {
                transport.close().await;
                return Err(error);
            }
        };
        let subscriber = subscription.id();

        let (session, pump) = Session::new(
            Arc::clone(&transport),
            keys,
            Some(subscription),
            Arc::clone(&self.context),
        );
        if let Err(error) = self.hub.register(session.clone()).await {
            let _ = self.pubsub.unsubscribe(subscriber, &[]).await;
            transport.close().await;
            return Err(error);
        }

        session.mark_open();
        debug!(session_id = %session.id(), subscriber = %subscriber, "session connected");
        self.context.handler.on_connect(&session);
        session.spawn(pump);
        Ok(session)
    }

    /// Feed one event from the transport's read side.
    pub async fn handle_inbound(&self, session: &Session, event: InboundEvent) {
        let handler = &self.context.handler;
        match event {
            InboundEvent::Text(payload) => handler.on_message(session, payload),
            InboundEvent::Binary(payload) => handler.on_message_binary(session, payload),
            InboundEvent::Pong => handler.on_pong(session),
            InboundEvent::Close { code, reason } => handler.on_close(session, code, &reason),
            InboundEvent::Disconnected => {
                let _ = self.hub.unregister(session.id()).await;
                session.close().await;
            }
        }
    }

    /// Send a text message to every session.
    pub async fn broadcast(&self, text: impl Into<Bytes>) -> Result<()> {
        self.hub.broadcast(Envelope::text(text)).await
    }

    /// Send a text message to the sessions `filter` selects.
    pub async fn broadcast_filter<F>(&self, text: impl Into<Bytes>, filter: F) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.hub
            .broadcast(Envelope::text(text).with_filter(filter))
            .await
    }

    /// Send a binary message to every session.
    pub async fn broadcast_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.hub.broadcast(Envelope::binary(data)).await
    }

    /// Send a binary message to the sessions `filter` selects.
    pub async fn broadcast_binary_filter<F>(&self, data: impl Into<Bytes>, filter: F) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.hub
            .broadcast(Envelope::binary(data).with_filter(filter))
            .await
    }

    /// Send any envelope through the hub.
    pub async fn broadcast_envelope(&self, envelope: Envelope) -> Result<()> {
        self.hub.broadcast(envelope).await
    }

    /// Deliver `envelope` to the sessions its filter selects and close them
    /// after the configured grace period.
    pub async fn close_sessions(&self, envelope: Envelope) -> Result<()> {
        self.hub
            .close_sessions(envelope, self.context.options.close_grace())
            .await
    }

    /// Publish text to `topics`, waiting for room in full subscriber queues.
    pub async fn publish_text(&self, topics: &[&str], text: impl Into<Bytes>) -> Result<usize> {
        self.pubsub.publish(topics, Envelope::text(text)).await
    }

    /// Publish binary data to `topics`, waiting for room in full queues.
    pub async fn publish_binary(&self, topics: &[&str], data: impl Into<Bytes>) -> Result<usize> {
        self.pubsub.publish(topics, Envelope::binary(data)).await
    }

    /// Publish text to `topics`, dropping it for subscribers that are full.
    pub fn try_publish_text(&self, topics: &[&str], text: impl Into<Bytes>) -> Result<()> {
        self.pubsub.try_publish(topics, Envelope::text(text))
    }

    /// Publish binary data to `topics`, dropping it for full subscribers.
    pub fn try_publish_binary(&self, topics: &[&str], data: impl Into<Bytes>) -> Result<()> {
        self.pubsub.try_publish(topics, Envelope::binary(data))
    }

    /// Remove every subscriber of `topics`.
    pub async fn close_topics(&self, topics: &[&str]) -> Result<usize> {
        self.pubsub.close_topics(topics).await
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.hub.len()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.hub.sessions()
    }

    /// Shut the hub down with a final `envelope`, then the pub/sub actor.
    pub async fn shutdown(&self, envelope: Envelope) -> Result<()> {
        self.hub.shutdown(envelope).await?;
        match self.pubsub.shutdown().await {
            Ok(()) | Err(HeraldError::PubSubClosed) => {}
            Err(error) => return Err(error),
        }
        info!("herald shut down");
        Ok(())
    }

    /// Whether [`Herald::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }
}
