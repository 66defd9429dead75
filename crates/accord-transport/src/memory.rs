//! In-memory gossip hub used by tests and demos.

use crate::pubsub::{PeerEvent, PubSub, Subscription};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct SubEntry {
    messages: mpsc::UnboundedSender<Vec<u8>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
}

#[derive(Default)]
struct Hub {
    topics: HashMap<String, HashMap<u64, SubEntry>>,
    next_token: u64,
}

/// In-process [`PubSub`] hub.
///
/// Clones share the hub, so databases constructed with clones of the same
/// `MemoryPubSub` gossip with each other. Messages are delivered to every
/// subscriber of the topic, including the publisher's own subscription.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryPubSub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a topic (test observability)
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        hub.topics.get(topic).map_or(0, HashMap::len)
    }
}

/// Removes the subscription from the hub and notifies remaining peers.
struct UnsubscribeGuard {
    hub: Arc<Mutex<Hub>>,
    topic: String,
    token: u64,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = hub.topics.get_mut(&self.topic) {
            subs.remove(&self.token);
            for entry in subs.values() {
                let _ = entry.peer_events.send(PeerEvent::Left);
            }
            if subs.is_empty() {
                hub.topics.remove(&self.topic);
            }
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let token = {
            let mut hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
            let token = hub.next_token;
            hub.next_token += 1;

            let subs = hub.topics.entry(topic.to_string()).or_default();
            for entry in subs.values() {
                // Existing subscribers learn about the newcomer and the
                // newcomer learns about each of them.
                let _ = entry.peer_events.send(PeerEvent::Joined);
                let _ = peer_tx.send(PeerEvent::Joined);
            }
            subs.insert(
                token,
                SubEntry {
                    messages: msg_tx,
                    peer_events: peer_tx,
                },
            );
            token
        };
        tracing::debug!(topic, token, "subscribed");

        Ok(Subscription::with_guard(
            msg_rx,
            peer_rx,
            UnsubscribeGuard {
                hub: Arc::clone(&self.hub),
                topic: topic.to_string(),
                token,
            },
        ))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let hub = self.hub.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = hub.topics.get(topic) {
            for entry in subs.values() {
                let _ = entry.messages.send(data.clone());
            }
        }
        Ok(())
    }
}
