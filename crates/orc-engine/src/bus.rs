//! MessageBus — topic-filtered in-process pub/sub.

use orc_shared::ids::SubscriberId;
use orc_shared::message::Message;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A scoped subscription handle. Dropping it (or calling `unsubscribe`)
/// removes the queue from the fan-out set and drains it, matching the
/// scoped-acquisition-with-guaranteed-release contract.
pub struct Subscription {
    id: u64,
    subscriber_id: SubscriberId,
    receiver: mpsc::Receiver<Message>,
    bus: MessageBus,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let id = self.id;
        let subscriber_id = self.subscriber_id.clone();
        tokio::spawn(async move {
            bus.remove_queue(id).await;
            debug!(subscriber_id = %subscriber_id, "subscription released");
        });
    }
}

#[derive(Clone)]
struct Sink {
    id: u64,
    subscriber_id: SubscriberId,
    /// `None` means "all message types".
    message_types: Option<BTreeSet<String>>,
    sender: mpsc::Sender<Message>,
}

/// Fan-out of typed messages to per-subscriber bounded queues. Delivery is
/// best-effort in-process; there is no persistence and no cross-process
/// delivery.
#[derive(Clone)]
pub struct MessageBus {
    sinks: Arc<RwLock<Vec<Sink>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    capacity: usize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            capacity,
        }
    }

    /// Scoped acquisition with guaranteed release.
    pub async fn subscribe(&self, subscriber_id: SubscriberId, message_types: Option<Vec<String>>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let sink = Sink {
            id,
            subscriber_id: subscriber_id.clone(),
            message_types: message_types.map(|v| v.into_iter().collect()),
            sender: tx,
        };
        self.sinks.write().await.push(sink);
        Subscription {
            id,
            subscriber_id,
            receiver: rx,
            bus: self.clone(),
        }
    }

    async fn remove_queue(&self, id: u64) {
        self.sinks.write().await.retain(|s| s.id != id);
    }

    /// Completes once the message has been enqueued to every *currently*
    /// matching queue.
    pub async fn emit(&self, message: Message) {
        let matching: Vec<Sink> = {
            let sinks = self.sinks.read().await;
            sinks
                .iter()
                .filter(|s| match &s.message_types {
                    None => true,
                    Some(types) => types.contains(message.message_type()),
                })
                .cloned()
                .collect()
        };
        debug!(message_type = message.message_type(), sinks = matching.len(), "emitting message");
        for sink in matching {
            if sink.sender.send(message.clone()).await.is_err() {
                // Bus emit errors are swallowed with a warning.
                warn!(subscriber_id = %sink.subscriber_id, "dropped message, subscriber queue gone");
            }
        }
    }

    pub async fn emit_event(&self, message_type: impl Into<String>, data: serde_json::Value) {
        self.emit(Message::event(message_type, data)).await;
    }

    /// Subscribers currently registered for `message_type`, in the order
    /// they were added to the bus.
    pub async fn subscribers_for(&self, message_type: &str) -> Vec<SubscriberId> {
        let sinks = self.sinks.read().await;
        sinks
            .iter()
            .filter(|s| match &s.message_types {
                None => true,
                Some(types) => types.contains(message_type),
            })
            .map(|s| s.subscriber_id.clone())
            .collect()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn subscribers_receive_only_matching_message_types() {
        let bus = MessageBus::new(16);
        let mut foo_sub = bus
            .subscribe(SubscriberId::new("test"), Some(vec!["foo".to_string()]))
            .await;
        let mut bla_sub = bus
            .subscribe(SubscriberId::new("test"), Some(vec!["bla".to_string()]))
            .await;

        bus.emit_event("foo", json!(null)).await;
        bus.emit_event("foo", json!(null)).await;
        bus.emit_event("bla", json!(null)).await;
        bus.emit_event("bar", json!(null)).await;

        let mut foos = 0;
        while timeout(Duration::from_millis(20), foo_sub.recv()).await.ok().flatten().is_some() {
            foos += 1;
        }
        let mut blas = 0;
        while timeout(Duration::from_millis(20), bla_sub.recv()).await.ok().flatten().is_some() {
            blas += 1;
        }
        assert_eq!(foos, 2);
        assert_eq!(blas, 1);
    }

    #[tokio::test]
    async fn unsubscribed_message_types_are_not_delivered() {
        let bus = MessageBus::new(16);
        let all = bus.subscribe(SubscriberId::new("all"), None).await;
        drop(all);
        // Dropping releases the queue; emit afterwards must not hang or error.
        bus.emit_event("anything", json!(null)).await;
    }

    #[tokio::test]
    async fn subscribers_for_reflects_only_currently_registered_subscribers() {
        let bus = MessageBus::new(16);
        let _s1 = bus
            .subscribe(SubscriberId::new("sub_1"), Some(vec!["collect".to_string()]))
            .await;
        let before = bus.subscribers_for("collect").await;
        assert_eq!(before, vec![SubscriberId::new("sub_1")]);

        // A later registration must not retroactively appear in an
        // already-taken snapshot.
        let snapshot = before;
        let _s2 = bus
            .subscribe(SubscriberId::new("sub_2"), Some(vec!["collect".to_string()]))
            .await;
        assert_eq!(snapshot, vec![SubscriberId::new("sub_1")]);
    }
}
