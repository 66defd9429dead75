//! Ledger boundary for Accord databases.
//!
//! A ledger is a content-addressed collection of versioned trees, each
//! anchored to a DID and used here purely as durable key-path storage with
//! an ownership/signing concept. This crate defines the [`Ledger`] trait the
//! database core is written against, the tree/transaction vocabulary, the
//! deterministic key and DID derivation, and an in-memory implementation
//! used by tests and demos.

mod error;
mod identity;
mod ledger;
mod memory;
mod tree;

pub use error::{Error, Result};
pub use identity::{key_address, key_to_did, passphrase_key, Did};
pub use ledger::Ledger;
pub use memory::MemoryLedger;
pub use tree::{Resolution, Tip, Transaction, TreeHandle, TreeValue};
