//! Relay client for the `partymic-relay` WebSocket server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::RelayFrame;
use super::{RelayError, SignalingRelay, Subscription, SubscriptionHandle};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;
type RoomEvent = (String, String);
type JoinAck = oneshot::Sender<Result<(), String>>;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ClientState {
    subscribers: DashMap<RoomEvent, Vec<(u64, mpsc::UnboundedSender<Value>)>>,
    pending_joins: DashMap<RoomEvent, Vec<JoinAck>>,
    connected: AtomicBool,
}

pub struct WebSocketRelay {
    outbound: mpsc::UnboundedSender<RelayFrame>,
    state: Arc<ClientState>,
    next_id: AtomicU64,
    join_timeout: Duration,
}

impl WebSocketRelay {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        info!("Dialing relay at {url}");
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = ws.split();

        let state = Arc::new(ClientState::default());
        state.connected.store(true, Ordering::Relaxed);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_pump(sink, outbound_rx));
        tokio::spawn(read_pump(stream, Arc::clone(&state)));

        Ok(Self {
            outbound,
            state,
            next_id: AtomicU64::new(1),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        })
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    fn send(&self, frame: RelayFrame) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Closed);
        }
        self.outbound.send(frame).map_err(|_| RelayError::Closed)
    }

    fn remove_subscriber(&self, key: &RoomEvent, id: u64) -> bool {
        let mut now_empty = false;
        if let Some(mut list) = self.state.subscribers.get_mut(key) {
            list.retain(|(sid, _)| *sid != id);
            now_empty = list.is_empty();
        }
        if now_empty {
            self.state
                .subscribers
                .remove_if(key, |_, list| list.is_empty());
        }
        now_empty
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<(), RelayError> {
        self.send(RelayFrame::Publish {
            room_id: channel.to_string(),
            event: event.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, channel: &str, event: &str) -> Result<Subscription, RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Unavailable("relay connection lost".to_string()));
        }
        let key: RoomEvent = (channel.to_string(), event.to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Registered before joining so nothing delivered right after the ack is lost
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((id, tx));

        let (ack_tx, ack_rx) = oneshot::channel();
        self.state
            .pending_joins
            .entry(key.clone())
            .or_default()
            .push(ack_tx);

        let joined = match self.send(RelayFrame::Join {
            room_id: channel.to_string(),
            event: event.to_string(),
        }) {
            Ok(()) => match tokio::time::timeout(self.join_timeout, ack_rx).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(message))) => Err(RelayError::Unavailable(message)),
                Ok(Err(_)) => Err(RelayError::Closed),
                Err(_) => Err(RelayError::Unavailable(format!(
                    "no join acknowledgement for {channel} within {:?}",
                    self.join_timeout
                ))),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = joined {
            self.remove_subscriber(&key, id);
            return Err(e);
        }
        debug!("Joined {channel} for {event} as subscription #{id}");
        Ok(Subscription::new(SubscriptionHandle::new(channel, event, id), rx))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let key: RoomEvent = (handle.channel().to_string(), handle.event().to_string());
        if self.remove_subscriber(&key, handle.id()) {
            let _ = self.send(RelayFrame::Leave {
                room_id: key.0,
                event: Some(key.1),
            });
        }
    }
}

async fn write_pump(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<RelayFrame>) {
    while let Some(frame) = outbound.recv().await {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode relay frame: {e}");
                continue;
            }
        };
        trace!("--> {text}");
        if let Err(e) = sink.send(Message::text(text)).await {
            warn!("Relay send failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_pump(mut stream: WsStream, state: Arc<ClientState>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Error reading from relay: {e}");
                break;
            }
        };
        trace!("<-- {}", text.as_str());

        match RelayFrame::from_text(text.as_str()) {
            Ok(RelayFrame::Message {
                room_id,
                event,
                payload,
            }) => {
                if let Some(mut list) = state.subscribers.get_mut(&(room_id, event)) {
                    list.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
                }
            }
            Ok(RelayFrame::Joined { room_id, event }) => {
                if let Some((_, acks)) = state.pending_joins.remove(&(room_id, event)) {
                    for ack in acks {
                        let _ = ack.send(Ok(()));
                    }
                }
            }
            Ok(RelayFrame::Error {
                room_id: Some(room_id),
                message,
            }) => {
                warn!("Relay rejected request for {room_id}: {message}");
                let keys: Vec<RoomEvent> = state
                    .pending_joins
                    .iter()
                    .filter(|entry| entry.key().0 == room_id)
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in keys {
                    if let Some((_, acks)) = state.pending_joins.remove(&key) {
                        for ack in acks {
                            let _ = ack.send(Err(message.clone()));
                        }
                    }
                }
            }
            Ok(other) => debug!("Ignoring relay frame {other:?}"),
            Err(e) => warn!("Malformed relay frame: {e}"),
        }
    }

    state.connected.store(false, Ordering::Relaxed);
    // Ends every subscription stream and fails pending joins
    state.subscribers.clear();
    state.pending_joins.clear();
    info!("Relay connection closed");
}
