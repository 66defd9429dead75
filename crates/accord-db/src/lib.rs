//! Peer-replicated, CRDT-backed key-state database.
//!
//! Multiple untrusted writers converge on one shared application state
//! without a central server. Identity and authorization come from a
//! ledger-anchored writer directory; durability from per-writer document
//! checkpoints on the ledger; liveness from a gossip topic named by the
//! database's DID.
//!
//! # Architecture
//!
//! - **Task queue**: single-flight serialization with burst coalescing
//! - **State container**: typed reducer mutations over an Automerge document
//! - **Writer directory**: ledger-anchored DID allow-list
//! - **Convergence**: two-stage startup sync (local checkpoint, then peers)
//! - **Gossip channel**: live change-set propagation and peer bootstrap
//! - **Checkpoint writer**: coalesced snapshot persistence
//!
//! # Example
//!
//! ```no_run
//! use accord_db::{Database, DatabaseConfig, CreateOpts};
//! use accord_ledger::{MemoryLedger, TreeHandle, passphrase_key};
//! use accord_transport::MemoryPubSub;
//! use serde::{Serialize, Deserialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct AppState { msg: String }
//! struct SetMsg(String);
//!
//! # async fn demo() -> accord_db::Result<()> {
//! let ledger = Arc::new(MemoryLedger::new());
//! let pubsub = Arc::new(MemoryPubSub::new());
//! let reducer = |state: &mut AppState, action: &SetMsg| state.msg = action.0.clone();
//!
//! let alice_key = passphrase_key(b"alice", b"demo");
//! let alice_tree = TreeHandle::new(alice_key.clone());
//!
//! let db = Database::new("standup", reducer, DatabaseConfig::default(), ledger, pubsub)?;
//! db.create(&alice_key, CreateOpts { writers: vec![alice_tree.did().clone()], ..CreateOpts::default() }).await?;
//! db.start(alice_tree).await?;
//! db.dispatch(SetMsg("hi from alice".into())).await?;
//! assert_eq!(db.state().await.msg, "hi from alice");
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod database;
mod document;
mod error;
mod events;
mod gossip;
mod task_queue;
pub mod writers;

pub use checkpoint::checkpoint_path;
pub use database::{CreateOpts, Database, DatabaseConfig, Reducer};
pub use document::{ChangeSet, StateDoc};
pub use error::{Error, Result};
pub use events::{wait_for, DatabaseEvent, EventBus};
pub use gossip::Envelope;
pub use task_queue::{QueueMode, TaskQueue};

// Boundary re-exports so consumers rarely need the leaf crates directly
pub use accord_ledger::{Did, Ledger, TreeHandle};
pub use accord_transport::PubSub;
