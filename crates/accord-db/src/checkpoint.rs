//! Checkpoint persistence.
//!
//! After every successful local mutation the full document snapshot is
//! written to the local writer's own tree at `<databaseDid>/latest`,
//! serialized through an only-latest task queue: bursts of dispatches
//! coalesce so at most one ledger write is in flight and only the newest
//! pending snapshot is ever persisted. Persistence is decoupled from the
//! dispatch hot path; completion is reported via the `Sync` event.

use crate::document::ChangeSet;
use crate::events::{DatabaseEvent, EventBus};
use crate::task_queue::{QueueMode, TaskQueue};
use crate::{Error, Result};
use accord_ledger::{Did, Ledger, Transaction, TreeHandle, TreeValue};
use std::sync::Arc;

/// Tree path for a database's checkpoint under a writer's tree.
///
/// Part of the persisted layout: `<databaseDid>/latest` holds the writer's
/// last saved document for that database.
pub fn checkpoint_path(db_did: &Did) -> String {
    format!("{db_did}/latest")
}

/// Serialized writer of document snapshots to the local writer's tree
pub(crate) struct CheckpointWriter {
    ledger: Arc<dyn Ledger>,
    db_did: Did,
    events: EventBus,
    queue: TaskQueue<()>,
}

impl CheckpointWriter {
    pub(crate) fn new(ledger: Arc<dyn Ledger>, db_did: Did, events: EventBus) -> Self {
        let queue = TaskQueue::new(format!("checkpoint:{db_did}"), QueueMode::OnlyLatest);
        Self {
            ledger,
            db_did,
            events,
            queue,
        }
    }

    /// Enqueue a snapshot persist.
    ///
    /// Fire-and-forget from the caller's point of view: completion emits
    /// `Sync` with the change-set that triggered the persist, a superseded
    /// snapshot is silently coalesced away, and a failure is logged — the
    /// core never auto-retries, callers observe and decide.
    pub(crate) fn persist(&self, writer: TreeHandle, snapshot: Vec<u8>, changes: ChangeSet) {
        let ledger = Arc::clone(&self.ledger);
        let path = checkpoint_path(&self.db_did);
        let outcome = self.queue.send(Box::pin(async move {
            write_checkpoint(ledger.as_ref(), &writer, &path, snapshot).await
        }));

        let events = self.events.clone();
        let db_did = self.db_did.clone();
        tokio::spawn(async move {
            match outcome.await {
                Ok(()) => events.emit(DatabaseEvent::Sync(changes)),
                Err(Error::Superseded) => {
                    tracing::debug!(db = %db_did, "checkpoint coalesced away");
                }
                Err(err) => {
                    tracing::warn!(db = %db_did, %err, "checkpoint persist failed");
                }
            }
        });
    }
}

async fn write_checkpoint(
    ledger: &dyn Ledger,
    writer: &TreeHandle,
    path: &str,
    snapshot: Vec<u8>,
) -> Result<()> {
    ledger
        .play_transactions(
            writer,
            &[Transaction::SetData {
                path: path.to_string(),
                value: TreeValue::Bytes(snapshot),
            }],
        )
        .await?;
    Ok(())
}

/// Read a writer's checkpoint for a database, if any.
///
/// `Ok(None)` covers both "writer has no tree yet" and "tree has no
/// checkpoint at this path" — from the caller's view both mean the peer
/// simply has nothing to contribute yet.
pub(crate) async fn read_checkpoint(
    ledger: &dyn Ledger,
    writer_did: &Did,
    db_did: &Did,
) -> Result<Option<Vec<u8>>> {
    let tip = match ledger.get_tip(writer_did).await {
        Ok(tip) => tip,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let resolved = ledger
        .resolve_data(&tip, &checkpoint_path(db_did))
        .await?;
    match resolved.value {
        Some(TreeValue::Bytes(bytes)) => Ok(Some(bytes)),
        Some(other) => Err(Error::CorruptCheckpoint(format!(
            "checkpoint for {writer_did} is not a bytes value: {other:?}"
        ))),
        None => Ok(None),
    }
}
