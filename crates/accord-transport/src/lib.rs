//! Gossip pub/sub boundary for Accord databases.
//!
//! The database core only needs topic-scoped publish/subscribe with peer
//! join/leave notifications; this crate defines that trait plus an
//! in-memory hub used by tests and demos.

mod error;
mod memory;
mod pubsub;

pub use error::{Error, Result};
pub use memory::MemoryPubSub;
pub use pubsub::{PeerEvent, PubSub, Subscription};
