use std::sync::Arc;
use streamgate_core::{OutboundEvent, SubscriberId, Topic, Transport};

/// Decouples watcher output from transport delivery.
///
/// Watchers publish against a [`Topic`]; the router translates it into the
/// topic's canonical room name (a pure function of the topic's fields, so
/// the mapping is stable across restarts) and hands the event to the
/// transport. Per-subscriber delivery is used where fan-out differs within
/// one room: candle emissions and error events.
#[derive(Clone)]
pub struct EventRouter {
    transport: Arc<dyn Transport>,
}

impl EventRouter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Deliver to every subscriber of the topic's room.
    pub async fn publish(&self, topic: &Topic, event: &OutboundEvent) {
        self.transport.publish(&topic.room_name(), event).await;
    }

    /// Deliver to a single subscriber, tagged with the topic's room.
    pub async fn send(&self, subscriber: &SubscriberId, topic: &Topic, event: &OutboundEvent) {
        self.transport
            .send(subscriber, &topic.room_name(), event)
            .await;
    }
}
