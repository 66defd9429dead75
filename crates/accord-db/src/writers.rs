//! Writer directory.
//!
//! The authoritative list of DIDs allowed to write to a database lives on
//! the database's own ledger tree at `writers/<did> = authorization
//! timestamp`. The list only ever grows; revocation is out of scope.

use crate::Result;
use accord_ledger::{Did, Ledger, Transaction, TreeHandle, TreeValue};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tree path prefix holding the writer map
pub(crate) const WRITERS_PATH: &str = "writers";

/// Resolve the full writer list for a database.
///
/// A database tree with no writer entries yields an empty list.
pub async fn writer_list(ledger: &dyn Ledger, db_did: &Did) -> Result<Vec<Did>> {
    let tip = ledger.get_tip(db_did).await?;
    let resolved = ledger.resolve_data(&tip, WRITERS_PATH).await?;
    let mut writers = Vec::new();
    if let Some(TreeValue::Map(entries)) = resolved.value {
        writers.extend(entries.into_keys().map(Did::new));
    }
    Ok(writers)
}

/// Whether a DID is authorized to write to the database
pub async fn is_writer(ledger: &dyn Ledger, db_did: &Did, did: &Did) -> Result<bool> {
    Ok(writer_list(ledger, db_did).await?.contains(did))
}

/// Grant write access to the given DIDs.
///
/// The handle must carry the database admin key; an unauthorized key fails
/// at the ledger and the error is propagated unchanged.
pub async fn allow_writers(
    ledger: &dyn Ledger,
    db_tree: &TreeHandle,
    dids: &[Did],
) -> Result<()> {
    let now = unix_now();
    let txns: Vec<Transaction> = dids
        .iter()
        .map(|did| Transaction::SetData {
            path: format!("{WRITERS_PATH}/{did}"),
            value: TreeValue::Int(now),
        })
        .collect();
    ledger.play_transactions(db_tree, &txns).await?;
    tracing::debug!(db = %db_tree.did(), count = dids.len(), "granted writers");
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
