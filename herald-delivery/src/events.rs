//! Delivery events
//!
//! The pipeline publishes one [`DeliveryEvent`] per lifecycle transition on a
//! `tokio::sync::broadcast` channel. Subscribers that fall behind lose the
//! oldest events; delivery itself never waits for them.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{error::RateLimitKind, message::MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A message was admitted to the queue.
    Queued { id: MessageId, priority: i32 },
    /// A message was delivered.
    Sent { id: MessageId, attempts: u32 },
    /// A transient failure; the message waits `delay` before its next attempt.
    Retrying {
        id: MessageId,
        retry_count: u32,
        delay: Duration,
    },
    /// A rate-limit gate refused the message.
    RateLimited {
        id: MessageId,
        kind: RateLimitKind,
        retry_after: Duration,
    },
    /// A message failed permanently.
    Failed { id: MessageId, error: String },
    /// Pending messages were rejected by a clear.
    Cleared { count: usize, reason: String },
    /// Processing was paused.
    Paused { reason: String },
    /// Processing resumed after a pause.
    Resumed,
    /// The worker loop stopped.
    Stopped,
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    /// Publish `event`; dropped when nobody is listening.
    pub fn emit(&self, event: DeliveryEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();

        bus.emit(DeliveryEvent::Paused {
            reason: "maintenance".to_string(),
        });
        bus.emit(DeliveryEvent::Resumed);

        assert_eq!(
            receiver.recv().await.unwrap(),
            DeliveryEvent::Paused {
                reason: "maintenance".to_string()
            }
        );
        assert_eq!(receiver.recv().await.unwrap(), DeliveryEvent::Resumed);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new(0);
        bus.emit(DeliveryEvent::Stopped);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(DeliveryEvent::Cleared {
            count: 2,
            reason: "shutdown".to_string(),
        })
        .unwrap();

        assert_eq!(json["event"], "cleared");
        assert_eq!(json["count"], 2);
    }
}
