//! Pub/sub trait definitions.

use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use tokio::sync::mpsc;

/// Peer membership change on a subscribed topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Another subscriber joined the topic
    Joined,
    /// A subscriber left the topic
    Left,
}

/// A live topic subscription.
///
/// Carries two channels: raw message payloads and peer join/leave events.
/// Dropping the subscription unsubscribes (implementations attach a guard).
pub struct Subscription {
    /// Message payloads published to the topic
    pub messages: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Peer membership events for the topic
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl Subscription {
    /// Subscription without an unsubscribe guard
    pub fn new(
        messages: mpsc::UnboundedReceiver<Vec<u8>>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        Self {
            messages,
            peer_events,
            _guard: None,
        }
    }

    /// Subscription whose guard unsubscribes on drop
    pub fn with_guard(
        messages: mpsc::UnboundedReceiver<Vec<u8>>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        guard: impl Any + Send,
    ) -> Self {
        Self {
            messages,
            peer_events,
            _guard: Some(Box::new(guard)),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Topic-scoped gossip transport.
///
/// Delivery is best-effort: publishers get no acknowledgement of fan-out and
/// may receive their own messages back, so consumers must apply messages
/// idempotently.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Subscribe to a topic, receiving messages and peer events
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publish a payload to every current subscriber of a topic
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;
}
