//! Two replicas of one database converging in a single process.
//!
//! Alice creates the database and writes a note; Bob starts cold, catches up
//! through the ledger checkpoint, then edits live over gossip.

use accord_db::{wait_for, CreateOpts, Database, DatabaseConfig, DatabaseEvent};
use accord_ledger::{passphrase_key, Ledger, MemoryLedger, TreeHandle};
use accord_transport::{MemoryPubSub, PubSub};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Note {
    text: String,
    edits: i64,
}

#[derive(Debug, Clone)]
enum NoteEvent {
    Set(String),
}

fn reduce(note: &mut Note, event: &NoteEvent) {
    match event {
        NoteEvent::Set(text) => {
            note.text = text.clone();
            note.edits += 1;
        }
    }
}

fn new_replica(
    ledger: &Arc<dyn Ledger>,
    pubsub: &Arc<dyn PubSub>,
) -> Result<Database<Note, NoteEvent>> {
    Ok(Database::new(
        "standup-notes",
        reduce,
        DatabaseConfig::default(),
        Arc::clone(ledger),
        Arc::clone(pubsub),
    )?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());

    let alice_key = passphrase_key(b"alice's secret phrase", b"hello-db");
    let alice_tree = TreeHandle::new(alice_key.clone());
    let bob_tree = TreeHandle::new(passphrase_key(b"bob's secret phrase", b"hello-db"));

    // Alice anchors the database and grants both writers.
    let alice_db = new_replica(&ledger, &pubsub)?;
    alice_db
        .create(
            &alice_key,
            CreateOpts {
                writers: vec![alice_tree.did().clone(), bob_tree.did().clone()],
                initial_state: None,
            },
        )
        .await?;
    tracing::info!(did = %alice_db.did(), "database created");

    let mut alice_events = alice_db.subscribe();
    alice_db.start(alice_tree).await?;
    wait_for(&mut alice_events, DatabaseEvent::is_initial_sync).await?;

    alice_db
        .dispatch(NoteEvent::Set("ship the demo".into()))
        .await?;
    tracing::info!(note = %alice_db.state().await.text, "alice wrote");

    // Wait for the checkpoint so a cold replica can catch up via the ledger.
    wait_for(&mut alice_events, DatabaseEvent::is_sync).await?;

    let bob_db = new_replica(&ledger, &pubsub)?;
    let mut bob_events = bob_db.subscribe();
    bob_db.start(bob_tree).await?;
    wait_for(&mut bob_events, DatabaseEvent::is_initial_sync).await?;
    tracing::info!(note = %bob_db.state().await.text, "bob caught up");

    // Bob edits live; alice sees it over gossip.
    bob_db
        .dispatch(NoteEvent::Set("ship the demo, then lunch".into()))
        .await?;
    loop {
        wait_for(&mut alice_events, DatabaseEvent::is_update).await?;
        let note = alice_db.state().await;
        if note.text == "ship the demo, then lunch" {
            tracing::info!(note = %note.text, edits = note.edits, "alice converged");
            break;
        }
    }

    alice_db.stop();
    bob_db.stop();
    Ok(())
}
