//! Database event signaling.
//!
//! Broadcast-based fan-out to any number of subscribers, with a `wait_for`
//! helper for one-shot waits (the equivalent of a `once` listener).

use crate::document::ChangeSet;
use crate::{Error, Result};
use tokio::sync::broadcast;

/// Signals emitted by a database instance
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// The document changed, locally or from a remote change-set
    Update(ChangeSet),
    /// The local writer's own checkpoint has been folded in; the instance is
    /// usable from here on
    InitialLocalSync,
    /// Every reachable writer's checkpoint has been folded in
    InitialSync,
    /// A local change-set finished persisting to the ledger
    Sync(ChangeSet),
    /// A corrupt remote change-set or checkpoint was rejected; the document
    /// keeps serving the last good state
    Rejected(String),
}

impl DatabaseEvent {
    /// True for `Update` events
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update(_))
    }

    /// True for `InitialLocalSync` events
    pub fn is_initial_local_sync(&self) -> bool {
        matches!(self, Self::InitialLocalSync)
    }

    /// True for `InitialSync` events
    pub fn is_initial_sync(&self) -> bool {
        matches!(self, Self::InitialSync)
    }

    /// True for `Sync` events
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::Sync(_))
    }

    /// True for `Rejected` events
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Multi-subscriber event fan-out for one database instance
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DatabaseEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers. Emitting with no
    /// subscribers is a no-op, never an error.
    pub fn emit(&self, event: DatabaseEvent) {
        let _ = self.tx.send(event);
    }
}

/// Wait until an event matching the predicate arrives.
///
/// Lagged subscribers skip ahead (old events are dropped, not errors);
/// returns `Err` only if the database instance is gone.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<DatabaseEvent>,
    mut matches: impl FnMut(&DatabaseEvent) -> bool,
) -> Result<DatabaseEvent> {
    loop {
        match rx.recv().await {
            Ok(event) if matches(&event) => return Ok(event),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::precondition("database event bus closed"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(DatabaseEvent::InitialLocalSync);

        assert!(a.recv().await.unwrap().is_initial_local_sync());
        assert!(b.recv().await.unwrap().is_initial_local_sync());
    }

    #[tokio::test]
    async fn wait_for_skips_non_matching_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(DatabaseEvent::Update(ChangeSet::empty()));
        bus.emit(DatabaseEvent::InitialSync);

        let event = wait_for(&mut rx, DatabaseEvent::is_initial_sync).await.unwrap();
        assert!(event.is_initial_sync());
    }
}
