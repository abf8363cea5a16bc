use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{RelayError, SignalingRelay, Subscription, SubscriptionHandle};

struct Subscriber {
    id: u64,
    event: String,
    tx: mpsc::UnboundedSender<Value>,
}

/// Process-local relay. Every subscriber on a channel, the publisher's own
/// subscriptions included, receives each publish.
pub struct InMemoryRelay {
    channels: DashMap<String, Vec<Subscriber>>,
    published: DashMap<String, Vec<Value>>,
    next_id: AtomicU64,
    redeliver: AtomicBool,
    available: AtomicBool,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            published: DashMap::new(),
            next_id: AtomicU64::new(1),
            redeliver: AtomicBool::new(false),
            available: AtomicBool::new(true),
        }
    }

    /// Deliver every message twice.
    pub fn with_redelivery(self) -> Self {
        self.redeliver.store(true, Ordering::Relaxed);
        self
    }

    /// While unavailable, publish and subscribe fail and existing
    /// subscriptions are closed.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
        if !available {
            self.channels.clear();
        }
    }

    /// Every payload published on `channel`, in order.
    pub fn published(&self, channel: &str) -> Vec<Value> {
        self.published
            .get(channel)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }

    fn ensure_available(&self) -> Result<(), RelayError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("in-memory relay is offline".to_string()))
        }
    }
}

#[async_trait]
impl SignalingRelay for InMemoryRelay {
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<(), RelayError> {
        self.ensure_available()?;
        self.published
            .entry(channel.to_string())
            .or_default()
            .push(payload.clone());

        let copies = if self.redeliver.load(Ordering::Relaxed) { 2 } else { 1 };
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|s| !s.tx.is_closed());
            for subscriber in subscribers.iter().filter(|s| s.event == event) {
                for _ in 0..copies {
                    let _ = subscriber.tx.send(payload.clone());
                }
            }
            trace!(
                "Published {event} on {channel} to {} subscriber(s)",
                subscribers.len()
            );
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, event: &str) -> Result<Subscription, RelayError> {
        self.ensure_available()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                id,
                event: event.to_string(),
                tx,
            });
        debug!("Subscribed #{id} to {event} on {channel}");
        Ok(Subscription::new(SubscriptionHandle::new(channel, event, id), rx))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(mut subscribers) = self.channels.get_mut(handle.channel()) {
            subscribers.retain(|s| s.id != handle.id());
        }
        self.channels
            .remove_if(handle.channel(), |_, subscribers| subscribers.is_empty());
        debug!("Unsubscribed #{} from {}", handle.id(), handle.channel());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let relay = InMemoryRelay::new();
        let mut signal = relay.subscribe("webrtc-party-1", "signal").await.unwrap();
        let mut other = relay.subscribe("webrtc-party-1", "chat").await.unwrap();
        let mut elsewhere = relay.subscribe("webrtc-party-2", "signal").await.unwrap();

        relay
            .publish("webrtc-party-1", "signal", json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(signal.recv().await, Some(json!({"n": 1})));
        assert!(other.rx.try_recv().is_err());
        assert!(elsewhere.rx.try_recv().is_err());
        assert_eq!(relay.published("webrtc-party-1"), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_redelivery_duplicates_messages() {
        let relay = InMemoryRelay::new().with_redelivery();
        let mut sub = relay.subscribe("c", "signal").await.unwrap();
        relay.publish("c", "signal", json!(1)).await.unwrap();
        assert_eq!(sub.recv().await, Some(json!(1)));
        assert_eq!(sub.recv().await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream_and_is_idempotent() {
        let relay = InMemoryRelay::new();
        let mut a = relay.subscribe("c", "signal").await.unwrap();
        let b = relay.subscribe("c", "signal").await.unwrap();
        assert_eq!(relay.subscriber_count("c"), 2);

        let handle = a.handle().clone();
        relay.unsubscribe(&handle);
        relay.unsubscribe(&handle);
        assert_eq!(a.recv().await, None);
        assert_eq!(relay.subscriber_count("c"), 1);

        relay.unsubscribe(b.handle());
        assert_eq!(relay.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_relay_fails_and_closes_subscriptions() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe("c", "signal").await.unwrap();
        relay.set_available(false);

        assert!(matches!(
            relay.publish("c", "signal", json!(1)).await,
            Err(RelayError::Unavailable(_))
        ));
        assert!(matches!(
            relay.subscribe("c", "signal").await,
            Err(RelayError::Unavailable(_))
        ));
        assert_eq!(sub.recv().await, None);
    }
}
