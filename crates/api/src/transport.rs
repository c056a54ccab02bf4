use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use streamgate_core::{OutboundEvent, SubscriberId, Transport};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

/// Wire envelope wrapping every outbound event.
#[derive(Serialize)]
struct ServerEnvelope<'a> {
    event: &'a str,
    room: &'a str,
    data: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    /// connection id → outbound message queue of its socket writer.
    peers: HashMap<SubscriberId, UnboundedSender<String>>,
    /// room name → connections joined to it.
    rooms: HashMap<String, HashSet<SubscriberId>>,
}

/// Room-based delivery over per-connection WebSocket writer queues.
///
/// Connections register a sender on upgrade and join the room of every
/// topic they subscribe to; the engine publishes against room names and
/// never sees sockets.
#[derive(Default)]
pub struct WsTransport {
    inner: RwLock<Inner>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, subscriber: SubscriberId, sender: UnboundedSender<String>) {
        self.inner.write().await.peers.insert(subscriber, sender);
    }

    /// Drop a connection and every room membership it holds.
    pub async fn unregister(&self, subscriber: &SubscriberId) {
        let mut inner = self.inner.write().await;
        inner.peers.remove(subscriber);
        inner.rooms.retain(|_, members| {
            members.remove(subscriber);
            !members.is_empty()
        });
    }

    pub async fn join(&self, subscriber: &SubscriberId, room: &str) {
        self.inner
            .write()
            .await
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(*subscriber);
    }

    pub async fn leave(&self, subscriber: &SubscriberId, room: &str) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(subscriber);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }

    fn envelope(room: &str, event: &OutboundEvent) -> Option<String> {
        let data = match serde_json::to_value(event) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(room, error = %err, "failed to serialise outbound event");
                return None;
            }
        };
        serde_json::to_string(&ServerEnvelope {
            event: event.event_name(),
            room,
            data,
        })
        .ok()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn publish(&self, room: &str, event: &OutboundEvent) {
        let Some(payload) = Self::envelope(room, event) else {
            return;
        };
        let inner = self.inner.read().await;
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        for subscriber in members {
            if let Some(sender) = inner.peers.get(subscriber) {
                // A closed queue means the socket is going away; its
                // disconnect path will clean the membership up.
                let _ = sender.send(payload.clone());
            }
        }
    }

    async fn send(&self, subscriber: &SubscriberId, room: &str, event: &OutboundEvent) {
        let Some(payload) = Self::envelope(room, event) else {
            return;
        };
        if let Some(sender) = self.inner.read().await.peers.get(subscriber) {
            let _ = sender.send(payload);
        }
    }
}
