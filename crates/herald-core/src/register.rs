//! Bidirectional topic index owned exclusively by the pub/sub actor.
//!
//! `topics` maps a topic to its subscriber queues and `subscribers` maps a
//! queue to its topics. A key exists on either side only while its set is
//! non-empty. Removing a queue's last edge closes the queue in the same
//! step, including for sender clones a blocking publisher still holds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::ids::SubscriberId;

/// Create a subscriber queue holding up to `capacity` envelopes.
pub(crate) fn queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        QueueSender {
            tx,
            closed: closed.clone(),
        },
        QueueReceiver { rx, closed },
    )
}

/// Sending half of a subscriber queue.
#[derive(Clone)]
pub(crate) struct QueueSender {
    tx: mpsc::Sender<Arc<Envelope>>,
    closed: CancellationToken,
}

impl QueueSender {
    /// Wait for room and enqueue. Returns `false` if the queue is or becomes
    /// closed first.
    pub(crate) async fn send(&self, envelope: Arc<Envelope>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.closed.cancelled() => false,
            sent = self.tx.send(envelope) => sent.is_ok(),
        }
    }

    pub(crate) fn try_send(
        &self,
        envelope: Arc<Envelope>,
    ) -> Result<(), TrySendError<Arc<Envelope>>> {
        if self.closed.is_cancelled() {
            return Err(TrySendError::Closed(envelope));
        }
        self.tx.try_send(envelope)
    }

    /// Close the queue for every clone of this sender.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Receiving half of a subscriber queue.
///
/// Envelopes enqueued before the close are still yielded, then `None`.
#[derive(Debug)]
pub(crate) struct QueueReceiver {
    rx: mpsc::Receiver<Arc<Envelope>>,
    closed: CancellationToken,
}

impl QueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Arc<Envelope>> {
        if self.closed.is_cancelled() {
            self.rx.close();
            return self.rx.recv().await;
        }
        tokio::select! {
            biased;
            envelope = self.rx.recv() => envelope,
            () = self.closed.cancelled() => {
                self.rx.close();
                self.rx.recv().await
            }
        }
    }

    pub(crate) fn try_recv(&mut self) -> Result<Arc<Envelope>, TryRecvError> {
        if self.closed.is_cancelled() {
            self.rx.close();
        }
        self.rx.try_recv()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct Subscriber {
    queue: QueueSender,
    topics: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct Register {
    topics: HashMap<String, HashSet<SubscriberId>>,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl Register {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sender of an indexed queue.
    pub(crate) fn queue(&self, id: SubscriberId) -> Option<&QueueSender> {
        self.subscribers.get(&id).map(|s| &s.queue)
    }

    /// Add the edge `topic <-> id`, creating either side lazily.
    pub(crate) fn add(&mut self, topic: &str, id: SubscriberId, queue: &QueueSender) {
        let _ = self.topics.entry(topic.to_owned()).or_default().insert(id);
        let _ = self
            .subscribers
            .entry(id)
            .or_insert_with(|| Subscriber {
                queue: queue.clone(),
                topics: HashSet::new(),
            })
            .topics
            .insert(topic.to_owned());
    }

    /// Remove one edge. Returns `true` when the queue lost its last topic and
    /// was closed.
    pub(crate) fn remove(&mut self, topic: &str, id: SubscriberId) -> bool {
        let Some(ids) = self.topics.get_mut(topic) else {
            return false;
        };
        if !ids.remove(&id) {
            return false;
        }
        if ids.is_empty() {
            let _ = self.topics.remove(topic);
        }

        let Some(subscriber) = self.subscribers.get_mut(&id) else {
            return false;
        };
        let _ = subscriber.topics.remove(topic);
        if subscriber.topics.is_empty() {
            // The queue is closed here and nowhere else.
            subscriber.queue.close();
            let _ = self.subscribers.remove(&id);
            return true;
        }
        false
    }

    /// Remove every edge of `topic`. Returns how many queues were closed.
    pub(crate) fn remove_topic(&mut self, topic: &str) -> usize {
        let ids: Vec<SubscriberId> = self
            .topics
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter(|id| self.remove(topic, *id)).count()
    }

    /// Remove every edge of queue `id`. Returns `true` if it was closed.
    pub(crate) fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        let topics: Vec<String> = self
            .subscribers
            .get(&id)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default();
        let mut closed = false;
        for topic in topics {
            closed |= self.remove(&topic, id);
        }
        closed
    }

    /// Remove everything. Returns how many queues were closed.
    pub(crate) fn clear(&mut self) -> usize {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.iter().map(|topic| self.remove_topic(topic)).sum()
    }

    /// Every distinct queue subscribed to at least one of `topics`.
    pub(crate) fn recipients(&self, topics: &[String]) -> Vec<(SubscriberId, QueueSender)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for topic in topics {
            let Some(ids) = self.topics.get(topic) else {
                continue;
            };
            for id in ids {
                if seen.insert(*id) {
                    if let Some(subscriber) = self.subscribers.get(id) {
                        out.push((*id, subscriber.queue.clone()));
                    }
                }
            }
        }
        out
    }

    /// Topics of queue `id`, sorted.
    pub(crate) fn topics_of(&self, id: SubscriberId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscribers
            .get(&id)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Queues subscribed to `topic`, sorted.
    pub(crate) fn subscribers_of(&self, topic: &str) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self
            .topics
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Both indexes describe the same relation and hold no empty sets.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward_ok = self.topics.iter().all(|(topic, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.subscribers
                        .get(id)
                        .is_some_and(|s| s.topics.contains(topic))
                })
        });
        let reverse_ok = self.subscribers.iter().all(|(id, s)| {
            !s.topics.is_empty()
                && s.topics
                    .iter()
                    .all(|topic| self.topics.get(topic).is_some_and(|ids| ids.contains(id)))
        });
        forward_ok && reverse_ok
    }
}
