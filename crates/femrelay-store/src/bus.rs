//! Fire-and-forget event bus.

use femrelay_state::JobEvent;
use tokio::sync::broadcast;

/// Sink for job events; publishing never waits for observers.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, channel: &str, event: JobEvent);
}

/// Message delivered to bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub channel: String,
    pub event: JobEvent,
}

/// Broadcast-channel event bus.
///
/// Slow subscribers lag and lose old messages instead of blocking publishers.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastBus {
    fn publish(&self, channel: &str, event: JobEvent) {
        let message = BusMessage {
            channel: channel.to_string(),
            event,
        };
        // No subscribers is fine
        if self.sender.send(message).is_err() {
            tracing::trace!(channel, "Published event with no subscribers");
        }
    }
}
