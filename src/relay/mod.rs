//! Publish/subscribe channel that carries signaling between devices.
//!
//! Delivery is at-least-once with no ordering across channels. Payloads are
//! opaque JSON; the typed offer/answer layer lives in [`crate::signaling`].

pub mod memory;
pub mod protocol;
pub mod server;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::InMemoryRelay;
pub use server::RelayServer;
pub use websocket::WebSocketRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay connection closed")]
    Closed,
    #[error("failed to serialize relay frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Identifies one subscription so it can be cancelled independently of
/// other subscriptions on the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    channel: String,
    event: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, id: u64) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            id,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Payloads delivered on one `(channel, event)` pair. The stream ends when
/// the subscription is cancelled or the relay goes away.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(handle: SubscriptionHandle, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { handle, rx }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Fire-and-forget publish of `payload` under `event` on `channel`.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<(), RelayError>;

    async fn subscribe(&self, channel: &str, event: &str) -> Result<Subscription, RelayError>;

    /// Cancel a subscription. Idempotent and non-blocking so it can run
    /// during teardown.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}
