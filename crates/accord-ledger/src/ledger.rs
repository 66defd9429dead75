//! The ledger trait the database core is written against.

use crate::tree::{Resolution, Tip, Transaction, TreeHandle};
use crate::{Did, Result};
use async_trait::async_trait;

/// Durable, ownership-checked key-path storage anchored per DID.
///
/// Implementations must be safe to share across tasks; the database core
/// holds a ledger behind an `Arc<dyn Ledger>` and never assumes anything
/// about where the data lives.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up the current tip for a tree.
    ///
    /// Returns [`crate::Error::NotFound`] when the DID has no tree yet; the
    /// caller decides whether that is an error or just "no checkpoint yet".
    async fn get_tip(&self, did: &Did) -> Result<Tip>;

    /// Resolve a slash-separated path against the tree the tip anchors
    async fn resolve_data(&self, tip: &Tip, path: &str) -> Result<Resolution>;

    /// Play transactions against a tree, creating it if absent.
    ///
    /// The handle must carry a signing key. Creating a tree requires the
    /// key's native DID to match the handle DID; writing to an existing tree
    /// requires the key's address to be in the tree's owner list. Violations
    /// fail with [`crate::Error::Unauthorized`] and the batch is not applied.
    async fn play_transactions(&self, tree: &TreeHandle, txns: &[Transaction]) -> Result<Tip>;
}
