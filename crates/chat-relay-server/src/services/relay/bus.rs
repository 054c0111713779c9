use std::sync::Arc;
use tracing::debug;

use super::registry::SessionRegistry;
use crate::models::RelayEvent;

/// Delivery topics. A message is published to each topic independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<'a> {
    /// Everyone joined to one conversation's room.
    Room(&'a str),
    /// Every admin observer, regardless of room membership.
    Admin,
}

/// Single-process pub/sub over the session registry.
#[derive(Clone)]
pub struct RelayBus {
    registry: Arc<SessionRegistry>,
}

impl RelayBus {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, topic: Topic<'_>, event: &RelayEvent) -> usize {
        let subscribers = match topic {
            Topic::Room(conversation_id) => self.registry.room_subscribers(conversation_id),
            Topic::Admin => self.registry.admin_subscribers(),
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            if subscriber.send(event.clone()) {
                delivered += 1;
            } else {
                // Transport is gone but has not detached yet
                debug!(connection_id = %subscriber.connection_id, "Dropping event for closed connection");
            }
        }

        if delivered == 0 && matches!(topic, Topic::Room(_)) {
            debug!(?topic, "Published event with no live room subscribers");
        }
        delivered
    }

    pub fn publish_all(&self, topics: &[Topic<'_>], event: &RelayEvent) -> usize {
        topics.iter().map(|topic| self.publish(*topic, event)).sum()
    }
}
