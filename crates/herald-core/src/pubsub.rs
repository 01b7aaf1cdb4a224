//! Topic pub/sub actor.
//!
//! One task owns the [`Register`] and processes commands serially, so the
//! topic index needs no lock. Handles are cheap clones around the command
//! sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::errors::{HeraldError, Result};
use crate::ids::SubscriberId;
use crate::register::{self, QueueReceiver, QueueSender, Register};

/// How a publish reaches subscriber queues that are full.
enum Delivery {
    /// The publisher waits for room in every queue. The actor only resolves
    /// recipients; the sends run on the publisher's task.
    Blocking(oneshot::Sender<Vec<QueueSender>>),
    /// The actor attempts each enqueue once and drops on a full queue.
    BestEffort(Arc<Envelope>),
}

enum Command {
    Open {
        id: SubscriberId,
        queue: QueueSender,
    },
    Subscribe {
        id: SubscriberId,
        topics: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriberId,
        topics: Vec<String>,
        reply: Option<oneshot::Sender<()>>,
    },
    Publish {
        topics: Vec<String>,
        delivery: Delivery,
    },
    CloseTopics {
        topics: Vec<String>,
        reply: oneshot::Sender<usize>,
    },
    TopicsOf {
        id: SubscriberId,
        reply: oneshot::Sender<Vec<String>>,
    },
    SubscribersOf {
        topic: String,
        reply: oneshot::Sender<Vec<SubscriberId>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Receiving end of a subscriber queue.
///
/// The queue yields `None` once the actor has removed its last topic, or
/// once the actor shut down. Dropping a subscription releases its queue.
pub struct Subscription {
    id: SubscriberId,
    queue: QueueReceiver,
    commands: mpsc::WeakSender<Command>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.queue.is_closed())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Queue identifier, used for later subscribe/unsubscribe calls.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next published envelope, or `None` when the queue is closed.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        self.queue.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> std::result::Result<Arc<Envelope>, TryRecvError> {
        self.queue.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.queue.is_closed() {
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        // Best effort: a full command queue leaves the queue to shutdown.
        let _ = commands.try_send(Command::Unsubscribe {
            id: self.id,
            topics: Vec::new(),
            reply: None,
        });
    }
}

/// Handle to the pub/sub actor.
#[derive(Clone)]
pub struct PubSub {
    commands: mpsc::Sender<Command>,
    queue_capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("queue_capacity", &self.queue_capacity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PubSub {
    /// Spawn the actor on the current runtime.
    ///
    /// `queue_capacity` bounds every subscriber queue; `command_capacity`
    /// bounds the actor's own command queue. Zero is treated as one.
    pub fn spawn(queue_capacity: usize, command_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(command_capacity.max(1));
        let actor = Actor {
            register: Register::new(),
            idle: HashMap::new(),
        };
        drop(tokio::spawn(actor.run(rx)));
        Self {
            commands: tx,
            queue_capacity: queue_capacity.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a fresh subscriber queue and subscribe it to `topics`.
    ///
    /// With no topics the queue stays open, unindexed, until it is
    /// subscribed or explicitly unsubscribed.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<Subscription> {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, rx) = register::queue(self.queue_capacity);
        self.send(Command::Open { id, queue }).await?;
        let subscription = Subscription {
            id,
            queue: rx,
            commands: self.commands.downgrade(),
        };
        if !topics.is_empty() {
            self.add_subscribe(id, topics).await?;
        }
        Ok(subscription)
    }

    /// Subscribe an existing queue to more topics.
    ///
    /// Fails with [`HeraldError::QueueClosed`] if the queue has already been
    /// closed; a closed queue is never reopened.
    pub async fn add_subscribe(&self, id: SubscriberId, topics: &[&str]) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            id,
            topics: owned(topics),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)?
    }

    /// Remove `topics` from queue `id`; no topics means all of them.
    ///
    /// The queue closes when its last topic is removed. Unknown queues and
    /// topics are ignored.
    pub async fn unsubscribe(&self, id: SubscriberId, topics: &[&str]) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            id,
            topics: owned(topics),
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)
    }

    /// Queue a full unsubscribe without waiting for the actor to apply it.
    pub(crate) async fn release(&self, id: SubscriberId) -> Result<()> {
        self.send(Command::Unsubscribe {
            id,
            topics: Vec::new(),
            reply: None,
        })
        .await
    }

    /// Deliver `envelope` to every queue subscribed to any of `topics`,
    /// waiting for room in full queues.
    ///
    /// A queue subscribed to several of the topics receives the envelope
    /// once. A queue closed while the publisher waits is skipped. Returns
    /// the number of queues that accepted it.
    pub async fn publish(&self, topics: &[&str], envelope: Envelope) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            topics: owned(topics),
            delivery: Delivery::Blocking(reply),
        })
        .await?;
        let recipients = rx.await.map_err(|_| HeraldError::PubSubClosed)?;

        let envelope = Arc::new(envelope);
        let mut delivered = 0;
        for queue in recipients {
            if queue.send(Arc::clone(&envelope)).await {
                delivered += 1;
            }
        }
        trace!(?topics, delivered, "published");
        Ok(delivered)
    }

    /// Best-effort publish. Never waits: a full subscriber queue silently
    /// misses the message, and so does everyone if the actor is backlogged.
    pub fn try_publish(&self, topics: &[&str], envelope: Envelope) -> Result<()> {
        let command = Command::Publish {
            topics: owned(topics),
            delivery: Delivery::BestEffort(Arc::new(envelope)),
        };
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(?topics, "pub/sub command queue full, publish dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(HeraldError::PubSubClosed),
        }
    }

    /// Remove every subscriber of `topics`. Returns how many queues closed.
    pub async fn close_topics(&self, topics: &[&str]) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CloseTopics {
            topics: owned(topics),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)
    }

    /// Topics queue `id` is subscribed to, sorted.
    pub async fn topics_of(&self, id: SubscriberId) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TopicsOf { id, reply }).await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)
    }

    /// Queues subscribed to `topic`, sorted.
    pub async fn subscribers_of(&self, topic: &str) -> Result<Vec<SubscriberId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubscribersOf {
            topic: topic.to_owned(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)
    }

    /// Stop accepting commands, apply the ones already queued, then close
    /// every remaining subscriber queue.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| HeraldError::PubSubClosed)?
    }

    /// Whether the actor has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HeraldError::PubSubClosed)
    }
}

fn owned(topics: &[&str]) -> Vec<String> {
    topics.iter().map(|t| (*t).to_owned()).collect()
}

struct Actor {
    register: Register,
    /// Open queues that have no topic yet.
    idle: HashMap<SubscriberId, QueueSender>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if let Command::Shutdown { reply } = command {
                commands.close();
                while let Some(pending) = commands.recv().await {
                    self.handle(pending);
                }
                self.close_all();
                let _ = reply.send(Ok(()));
                return;
            }
            self.handle(command);
        }
        // Every handle dropped.
        self.close_all();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Open { id, queue } => {
                let _ = self.idle.insert(id, queue);
            }
            Command::Subscribe { id, topics, reply } => {
                let _ = reply.send(self.subscribe(id, &topics));
            }
            Command::Unsubscribe { id, topics, reply } => {
                self.unsubscribe(id, &topics);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Publish { topics, delivery } => self.publish(&topics, delivery),
            Command::CloseTopics { topics, reply } => {
                let closed = topics
                    .iter()
                    .map(|topic| self.register.remove_topic(topic))
                    .sum();
                debug!(?topics, closed, "topics closed");
                let _ = reply.send(closed);
            }
            Command::TopicsOf { id, reply } => {
                let _ = reply.send(self.register.topics_of(id));
            }
            Command::SubscribersOf { topic, reply } => {
                let _ = reply.send(self.register.subscribers_of(&topic));
            }
            // Only reachable while draining after the first shutdown.
            Command::Shutdown { reply } => {
                let _ = reply.send(Err(HeraldError::PubSubClosed));
            }
        }
    }

    fn subscribe(&mut self, id: SubscriberId, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            return Ok(());
        }
        let queue = match self.register.queue(id) {
            Some(queue) => queue.clone(),
            None => self.idle.remove(&id).ok_or(HeraldError::QueueClosed(id))?,
        };
        for topic in topics {
            self.register.add(topic, id, &queue);
        }
        trace!(subscriber = %id, ?topics, "subscribed");
        Ok(())
    }

    fn unsubscribe(&mut self, id: SubscriberId, topics: &[String]) {
        if topics.is_empty() {
            let closed = self.register.remove_subscriber(id) || self.close_idle(id);
            trace!(subscriber = %id, closed, "unsubscribed from all topics");
            return;
        }
        for topic in topics {
            if self.register.remove(topic, id) {
                trace!(subscriber = %id, "subscriber queue closed");
            }
        }
    }

    fn close_idle(&mut self, id: SubscriberId) -> bool {
        self.idle.remove(&id).map(|queue| queue.close()).is_some()
    }

    fn publish(&self, topics: &[String], delivery: Delivery) {
        let recipients = self.register.recipients(topics);
        match delivery {
            Delivery::Blocking(reply) => {
                let queues = recipients.into_iter().map(|(_, queue)| queue).collect();
                let _ = reply.send(queues);
            }
            Delivery::BestEffort(envelope) => {
                for (id, queue) in recipients {
                    if let Err(TrySendError::Full(_)) = queue.try_send(Arc::clone(&envelope)) {
                        trace!(subscriber = %id, "subscriber queue full, message dropped");
                    }
                }
            }
        }
    }

    fn close_all(&mut self) {
        let topics = self.register.topic_count();
        let closed = self.register.clear() + self.idle.len();
        for (_, queue) in self.idle.drain() {
            queue.close();
        }
        debug!(topics, closed, "pub/sub actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn full_queues(pubsub: &PubSub, n: usize) -> Vec<Subscription> {
        let mut subs = Vec::new();
        for _ in 0..n {
            subs.push(pubsub.subscribe(&["t"]).await.unwrap());
        }
        pubsub.try_publish(&["t"], Envelope::text("m0")).unwrap();
        // Round trip so the best-effort publish has been applied.
        let _ = pubsub.subscribers_of("t").await.unwrap();
        subs
    }

    #[tokio::test]
    async fn subscribe_and_publish() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["news"]).await.unwrap();
        let delivered = pubsub
            .publish(&["news"], Envelope::text("hello"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sub.recv().await.unwrap().payload(), "hello");
    }

    #[tokio::test]
    async fn publish_to_unrelated_topic_is_not_delivered() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["a"]).await.unwrap();
        assert_eq!(pubsub.publish(&["b"], Envelope::text("x")).await.unwrap(), 0);
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn publish_to_overlapping_topics_delivers_once() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["a", "b"]).await.unwrap();
        let delivered = pubsub
            .publish(&["a", "b"], Envelope::text("x"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(sub.recv().await.is_some());
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn add_subscribe_extends_existing_queue() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&[]).await.unwrap();
        pubsub.add_subscribe(sub.id(), &["a", "b"]).await.unwrap();
        assert_eq!(pubsub.topics_of(sub.id()).await.unwrap(), vec!["a", "b"]);

        let _ = pubsub.publish(&["b"], Envelope::text("x")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload(), "x");
    }

    #[tokio::test]
    async fn blocking_publish_waits_for_room() {
        let pubsub = PubSub::spawn(1, 16);
        let mut subs = full_queues(&pubsub, 3).await;

        let publisher = pubsub.clone();
        let publish =
            tokio::spawn(async move { publisher.publish(&["t"], Envelope::text("m")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publish.is_finished());

        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().payload(), "m0");
        }
        assert_eq!(publish.await.unwrap().unwrap(), 3);
        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().payload(), "m");
        }
    }

    #[tokio::test]
    async fn best_effort_publish_drops_on_full_queues() {
        let pubsub = PubSub::spawn(1, 16);
        let mut subs = full_queues(&pubsub, 3).await;

        pubsub.try_publish(&["t"], Envelope::text("m")).unwrap();
        let _ = pubsub.subscribers_of("t").await.unwrap();

        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().payload(), "m0");
            assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
        }
    }

    #[tokio::test]
    async fn removing_last_topic_closes_queue() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["a", "b"]).await.unwrap();

        pubsub.unsubscribe(sub.id(), &["a"]).await.unwrap();
        assert_eq!(pubsub.topics_of(sub.id()).await.unwrap(), vec!["b"]);

        pubsub.unsubscribe(sub.id(), &["b"]).await.unwrap();
        assert!(sub.recv().await.is_none());
        assert_eq!(pubsub.publish(&["a", "b"], Envelope::text("x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_queue_cannot_be_resubscribed() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["a"]).await.unwrap();
        pubsub.unsubscribe(sub.id(), &[]).await.unwrap();
        assert!(sub.recv().await.is_none());

        let err = pubsub.add_subscribe(sub.id(), &["a"]).await.unwrap_err();
        assert!(matches!(err, HeraldError::QueueClosed(id) if id == sub.id()));

        // A fresh queue is the only way back in.
        let mut fresh = pubsub.subscribe(&["a"]).await.unwrap();
        assert_ne!(fresh.id(), sub.id());
        let _ = pubsub.publish(&["a"], Envelope::text("x")).await.unwrap();
        assert_eq!(fresh.recv().await.unwrap().payload(), "x");
    }

    #[tokio::test]
    async fn unsubscribe_during_blocked_publish_closes_queue() {
        let pubsub = PubSub::spawn(1, 16);
        let mut sub = pubsub.subscribe(&["t"]).await.unwrap();
        assert_eq!(pubsub.publish(&["t"], Envelope::text("fill")).await.unwrap(), 1);

        let publisher = pubsub.clone();
        let late =
            tokio::spawn(async move { publisher.publish(&["t"], Envelope::text("late")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!late.is_finished());

        pubsub.unsubscribe(sub.id(), &[]).await.unwrap();
        assert!(pubsub.topics_of(sub.id()).await.unwrap().is_empty());

        assert_eq!(sub.recv().await.unwrap().payload(), "fill");
        assert!(sub.recv().await.is_none());
        assert_eq!(late.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_releases_its_queue() {
        let pubsub = PubSub::spawn(8, 8);
        let idle = pubsub.subscribe(&[]).await.unwrap();
        let idle_id = idle.id();
        let subscribed = pubsub.subscribe(&["a"]).await.unwrap();
        drop(idle);
        drop(subscribed);

        assert!(pubsub.subscribers_of("a").await.unwrap().is_empty());
        assert!(matches!(
            pubsub.add_subscribe(idle_id, &["a"]).await,
            Err(HeraldError::QueueClosed(id)) if id == idle_id
        ));
    }

    #[tokio::test]
    async fn best_effort_publish_is_dropped_when_actor_is_backlogged() {
        let pubsub = PubSub::spawn(8, 1);
        let mut sub = pubsub.subscribe(&["t"]).await.unwrap();

        // No await in between: the actor cannot drain its single slot.
        pubsub.try_publish(&["t"], Envelope::text("queued")).unwrap();
        pubsub.try_publish(&["t"], Envelope::text("dropped")).unwrap();
        let _ = pubsub.subscribers_of("t").await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload(), "queued");
        assert!(matches!(sub.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unsubscribe_all_closes_idle_queue() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&[]).await.unwrap();
        pubsub.unsubscribe(sub.id(), &[]).await.unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_topics_removes_subscribers() {
        let pubsub = PubSub::spawn(8, 8);
        let mut only_t = pubsub.subscribe(&["t"]).await.unwrap();
        let mut t_and_u = pubsub.subscribe(&["t", "u"]).await.unwrap();

        assert_eq!(pubsub.close_topics(&["t"]).await.unwrap(), 1);
        assert!(only_t.recv().await.is_none());
        assert!(pubsub.subscribers_of("t").await.unwrap().is_empty());

        let _ = pubsub.publish(&["u"], Envelope::text("x")).await.unwrap();
        assert_eq!(t_and_u.recv().await.unwrap().payload(), "x");
    }

    #[tokio::test]
    async fn shutdown_closes_queues_and_rejects_commands() {
        let pubsub = PubSub::spawn(8, 8);
        let mut subscribed = pubsub.subscribe(&["a"]).await.unwrap();
        let mut idle = pubsub.subscribe(&[]).await.unwrap();

        pubsub.shutdown().await.unwrap();
        assert!(pubsub.is_closed());
        assert!(subscribed.recv().await.is_none());
        assert!(idle.recv().await.is_none());

        assert!(matches!(
            pubsub.subscribe(&["a"]).await,
            Err(HeraldError::PubSubClosed)
        ));
        assert!(matches!(
            pubsub.try_publish(&["a"], Envelope::text("x")),
            Err(HeraldError::PubSubClosed)
        ));
        assert!(matches!(
            pubsub.shutdown().await,
            Err(HeraldError::PubSubClosed)
        ));
    }

    #[tokio::test]
    async fn shutdown_applies_queued_commands_first() {
        let pubsub = PubSub::spawn(8, 8);
        let mut sub = pubsub.subscribe(&["a"]).await.unwrap();
        pubsub.try_publish(&["a"], Envelope::text("before")).unwrap();
        pubsub.shutdown().await.unwrap();

        assert_eq!(sub.recv().await.unwrap().payload(), "before");
        assert!(sub.recv().await.is_none());
    }
}
