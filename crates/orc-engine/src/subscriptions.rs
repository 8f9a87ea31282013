//! SubscriptionHandler — registry of subscribers and the message types
//! they accept.

use crate::bus::MessageBus;
use dashmap::DashMap;
use orc_shared::ids::SubscriberId;
use orc_shared::model::{Subscriber, Subscription};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tracks which external subscribers accept which message types with which
/// timeouts. The registry is single-writer; readers take a
/// snapshot.
#[derive(Clone)]
pub struct SubscriptionHandler {
    subscribers: Arc<DashMap<SubscriberId, Subscriber>>,
    next_registration_seq: Arc<AtomicU64>,
    bus: MessageBus,
}

impl SubscriptionHandler {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_registration_seq: Arc::new(AtomicU64::new(0)),
            bus,
        }
    }

    /// Upsert; emits an `Event("subscriber-changed")`.
    pub async fn add_subscription(
        &self,
        subscriber_id: SubscriberId,
        message_type: impl Into<String>,
        wait_for_completion: bool,
        timeout: Duration,
    ) -> orc_shared::TaskerResult<Subscription> {
        let message_type = message_type.into();
        let sub = Subscription::new(subscriber_id.clone(), message_type.clone(), wait_for_completion, timeout)?;
        let next_registration_seq = &self.next_registration_seq;
        self.subscribers
            .entry(subscriber_id.clone())
            .or_insert_with(|| {
                let seq = next_registration_seq.fetch_add(1, Ordering::SeqCst);
                Subscriber::new(subscriber_id.clone(), seq)
            })
            .upsert(sub.clone());
        debug!(subscriber_id = %subscriber_id, message_type = %message_type, "subscription added");
        self.bus
            .emit_event("subscriber-changed", json!({"subscriber_id": subscriber_id.to_string()}))
            .await;
        Ok(sub)
    }

    /// Idempotent.
    pub fn remove_subscription(&self, subscriber_id: &SubscriberId, message_type: &str) {
        if let Some(mut entry) = self.subscribers.get_mut(subscriber_id) {
            entry.remove(message_type);
        }
    }

    pub fn remove_subscriber(&self, subscriber_id: &SubscriberId) {
        self.subscribers.remove(subscriber_id);
    }

    /// Stable ordering by insertion time. Snapshot reflects only
    /// subscribers present at the moment of the call; it is the caller's
    /// responsibility (TaskHandler) to take this snapshot exactly once at
    /// step start so later registrations don't retroactively join.
    pub fn list_subscriber_for(&self, message_type: &str) -> Vec<Subscription> {
        let mut result: Vec<(u64, Subscription)> = Vec::new();
        for entry in self.subscribers.iter() {
            if let Some(sub) = entry.value().get(message_type) {
                result.push((entry.value().registration_seq(), sub.clone()));
            }
        }
        result.sort_by_key(|(seq, _)| *seq);
        result.into_iter().map(|(_, s)| s).collect()
    }

    pub fn is_subscribed(&self, subscriber_id: &SubscriberId, message_type: &str) -> bool {
        self.subscribers
            .get(subscriber_id)
            .map(|s| s.get(message_type).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_subscription_rejects_zero_timeout() {
        let handler = SubscriptionHandler::new(MessageBus::new(8));
        let res = handler
            .add_subscription(SubscriberId::new("s"), "m", true, Duration::ZERO)
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn remove_subscription_is_idempotent() {
        let handler = SubscriptionHandler::new(MessageBus::new(8));
        handler
            .add_subscription(SubscriberId::new("s"), "m", true, Duration::from_secs(1))
            .await
            .unwrap();
        handler.remove_subscription(&SubscriberId::new("s"), "m");
        handler.remove_subscription(&SubscriberId::new("s"), "m");
        assert!(handler.list_subscriber_for("m").is_empty());
    }

    #[tokio::test]
    async fn list_subscriber_for_does_not_include_later_registrations() {
        let handler = SubscriptionHandler::new(MessageBus::new(8));
        handler
            .add_subscription(SubscriberId::new("sub_1"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        let snapshot = handler.list_subscriber_for("collect");
        assert_eq!(snapshot.len(), 1);

        handler
            .add_subscription(SubscriberId::new("sub_2"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        // Previously taken snapshot is unaffected; a fresh call sees both.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(handler.list_subscriber_for("collect").len(), 2);
    }

    #[tokio::test]
    async fn list_subscriber_for_orders_by_registration_not_id() {
        let handler = SubscriptionHandler::new(MessageBus::new(8));
        handler
            .add_subscription(SubscriberId::new("zzz_first"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        handler
            .add_subscription(SubscriberId::new("aaa_second"), "collect", true, Duration::from_secs(30))
            .await
            .unwrap();
        let order: Vec<SubscriberId> = handler.list_subscriber_for("collect").into_iter().map(|s| s.subscriber_id).collect();
        assert_eq!(order, vec![SubscriberId::new("zzz_first"), SubscriberId::new("aaa_second")]);
    }

    #[tokio::test]
    async fn remove_subscriber_drops_all_of_their_subscriptions() {
        let handler = SubscriptionHandler::new(MessageBus::new(8));
        handler
            .add_subscription(SubscriberId::new("s"), "a", true, Duration::from_secs(1))
            .await
            .unwrap();
        handler
            .add_subscription(SubscriberId::new("s"), "b", true, Duration::from_secs(1))
            .await
            .unwrap();
        handler.remove_subscriber(&SubscriberId::new("s"));
        assert!(handler.list_subscriber_for("a").is_empty());
        assert!(handler.list_subscriber_for("b").is_empty());
    }
}
