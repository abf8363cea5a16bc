//! WebSocket relay server.
//!
//! Clients join rooms (one per party channel) for specific events. A publish
//! is fanned out to every other member of the room joined for that event.
//! The sender never receives its own message. Empty rooms are dropped.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::RelayFrame;
use crate::config::RelayServerConfig;

struct Member {
    events: HashSet<String>,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

/// Room membership shared by every connection task.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, HashMap<u64, Member>>>,
    max_room_members: usize,
}

impl RoomRegistry {
    fn new(max_room_members: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            max_room_members,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |m| m.len())
    }

    fn handle(&self, client: u64, tx: &mpsc::UnboundedSender<RelayFrame>, frame: RelayFrame) {
        match frame {
            RelayFrame::Join { room_id, event } => self.join(client, tx, room_id, event),
            RelayFrame::Leave { room_id, event } => self.leave(client, &room_id, event.as_deref()),
            RelayFrame::Publish {
                room_id,
                event,
                payload,
            } => {
                let Some(members) = self.rooms.get(&room_id) else {
                    debug!("Publish to empty room {room_id} from client {client}");
                    return;
                };
                let mut delivered = 0;
                for (id, member) in members.iter() {
                    if *id != client && member.events.contains(&event) {
                        let frame = RelayFrame::Message {
                            room_id: room_id.clone(),
                            event: event.clone(),
                            payload: payload.clone(),
                        };
                        if member.tx.send(frame).is_ok() {
                            delivered += 1;
                        }
                    }
                }
                debug!("Relayed {event} in {room_id} from client {client} to {delivered} member(s)");
            }
            other => {
                warn!("Client {client} sent a server-only frame: {other:?}");
                let _ = tx.send(RelayFrame::Error {
                    room_id: None,
                    message: "unexpected frame type".to_string(),
                });
            }
        }
    }

    fn join(
        &self,
        client: u64,
        tx: &mpsc::UnboundedSender<RelayFrame>,
        room_id: String,
        event: String,
    ) {
        let mut members = self.rooms.entry(room_id.clone()).or_default();
        if !members.contains_key(&client) && members.len() >= self.max_room_members {
            let _ = tx.send(RelayFrame::Error {
                room_id: Some(room_id.clone()),
                message: format!("room {room_id} is full"),
            });
            drop(members);
            self.rooms.remove_if(&room_id, |_, m| m.is_empty());
            return;
        }
        members
            .entry(client)
            .or_insert_with(|| Member {
                events: HashSet::new(),
                tx: tx.clone(),
            })
            .events
            .insert(event.clone());
        let size = members.len();
        drop(members);

        info!("Client {client} joined {room_id} for {event} ({size} member(s))");
        let _ = tx.send(RelayFrame::Joined { room_id, event });
    }

    fn leave(&self, client: u64, room_id: &str, event: Option<&str>) {
        if let Some(mut members) = self.rooms.get_mut(room_id) {
            let remove = match (members.get_mut(&client), event) {
                (Some(member), Some(event)) => {
                    member.events.remove(event);
                    member.events.is_empty()
                }
                (Some(_), None) => true,
                (None, _) => false,
            };
            if remove {
                members.remove(&client);
                info!("Client {client} left {room_id}");
            }
        }
        self.rooms.remove_if(room_id, |_, m| m.is_empty());
    }

    fn remove_client(&self, client: u64) {
        let joined: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| room.value().contains_key(&client))
            .map(|room| room.key().clone())
            .collect();
        for room_id in joined {
            self.leave(client, &room_id, None);
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    registry: RoomRegistry,
    next_client: AtomicU64,
}

impl RelayServer {
    pub async fn bind(config: &RelayServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!("Relay server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry: RoomRegistry::new(config.max_room_members),
            next_client: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn rooms(&self) -> RoomRegistry {
        self.registry.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let client = self.next_client.fetch_add(1, Ordering::Relaxed);
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, client, registry).await {
                    debug!("Connection {client} from {peer} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    client: u64,
    registry: RoomRegistry,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    info!("Client {client} connected from {peer}");
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode relay frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match RelayFrame::from_text(text.as_str()) {
                Ok(frame) => registry.handle(client, &tx, frame),
                Err(e) => {
                    warn!("Malformed frame from client {client}: {e}");
                    let _ = tx.send(RelayFrame::Error {
                        room_id: None,
                        message: format!("malformed frame: {e}"),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from client {client}: {e}");
                break;
            }
        }
    }

    registry.remove_client(client);
    drop(tx);
    let _ = writer.await;
    info!("Client {client} disconnected");
    Ok(())
}
