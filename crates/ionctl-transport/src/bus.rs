//! Topic-filtered command broadcast.
//!
//! Uses [`tokio::sync::broadcast`] under the hood so every subscriber sees
//! every message without any single subscriber blocking the others.
//! A worker subscribes under its own name and receives messages addressed
//! to that name or to [`TOPIC_ALL`].
//!
//! Broadcasts are best-effort: a subscriber that falls more than the channel
//! capacity behind loses the oldest messages. Staleness is worse than loss
//! for time-critical hardware commands, so there is no reliable variant.

use ionctl_types::{CommandEnvelope, TOPIC_ALL, TopicMessage};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default channel capacity (messages buffered before the oldest are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Shared command bus. Clone it cheaply – all clones share the same
/// underlying broadcast channel.
#[derive(Clone, Debug)]
pub struct CommandBus {
    sender: broadcast::Sender<TopicMessage>,
}

impl CommandBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast `envelope` on `topic`.
    ///
    /// Never blocks. Returns the number of subscribers that were handed the
    /// message; `0` when nobody is listening, which is not an error.
    pub fn broadcast(&self, topic: &str, envelope: CommandEnvelope) -> usize {
        let kind = envelope.kind.clone();
        let message = TopicMessage {
            topic: topic.to_string(),
            envelope,
        };
        match self.sender.send(message) {
            Ok(n) => {
                debug!(topic, kind = %kind, receivers = n, "command broadcast");
                n
            }
            Err(_) => {
                debug!(topic, kind = %kind, "command broadcast with no subscribers; dropped");
                0
            }
        }
    }

    /// Subscribe as worker `name`. The subscriber receives messages sent to
    /// `name` and to [`TOPIC_ALL`].
    pub fn subscribe(&self, name: impl Into<String>) -> CommandSubscriber {
        CommandSubscriber {
            name: name.into(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A receiver filtered to one worker name plus [`TOPIC_ALL`].
pub struct CommandSubscriber {
    name: String,
    receiver: broadcast::Receiver<TopicMessage>,
}

impl CommandSubscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn wants(&self, message: &TopicMessage) -> bool {
        message.topic == TOPIC_ALL || message.topic == self.name
    }

    /// Wait for the next message addressed to this subscriber.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<TopicMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) if self.wants(&msg) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(subscriber = %self.name, lagged_by = n, "command subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv]. Returns `None` when no
    /// matching message is buffered.
    pub fn try_recv(&mut self) -> Option<TopicMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(msg) if self.wants(&msg) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(subscriber = %self.name, lagged_by = n, "command subscriber lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn envelope(kind: &str) -> CommandEnvelope {
        CommandEnvelope::new(kind, Map::new(), None)
    }

    #[test]
    fn broadcast_without_subscribers_is_not_an_error() {
        let bus = CommandBus::default();
        assert_eq!(bus.broadcast(TOPIC_ALL, envelope("SET")), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_own_topic_and_all() {
        let bus = CommandBus::default();
        let mut dds = bus.subscribe("dds");

        bus.broadcast("camera", envelope("CAPTURE"));
        bus.broadcast("dds", envelope("FREQ"));
        bus.broadcast(TOPIC_ALL, envelope("SET"));

        assert_eq!(dds.recv().await.unwrap().envelope.kind, "FREQ");
        assert_eq!(dds.recv().await.unwrap().envelope.kind, "SET");
        assert!(dds.try_recv().is_none());
    }

    #[tokio::test]
    async fn every_subscriber_sees_all_topic() {
        let bus = CommandBus::default();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");
        assert_eq!(bus.broadcast(TOPIC_ALL, envelope("SAFE")), 2);
        assert_eq!(a.recv().await.unwrap().topic, TOPIC_ALL);
        assert_eq!(b.recv().await.unwrap().topic, TOPIC_ALL);
    }

    /// Flooding a small channel must make a slow subscriber skip ahead, not
    /// block the sender.
    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = CommandBus::new(8);
        let mut slow = bus.subscribe("slow");
        for i in 0..100 {
            bus.broadcast(TOPIC_ALL, envelope(&format!("CMD{i}")));
        }
        // The oldest messages were dropped; the subscriber resumes at the
        // retained tail.
        let first = slow.recv().await.unwrap();
        assert_eq!(first.envelope.kind, "CMD92");
    }

    #[test]
    fn try_recv_on_empty_returns_none() {
        let bus = CommandBus::default();
        let mut sub = bus.subscribe("w");
        assert!(sub.try_recv().is_none());
        assert_eq!(sub.name(), "w");
        assert_eq!(bus.subscriber_count(), 1);
    }
}
