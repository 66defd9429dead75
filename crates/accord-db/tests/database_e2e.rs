//! End-to-end database scenarios over the in-memory ledger and gossip hub.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use accord_db::{
    checkpoint_path, wait_for, ChangeSet, CreateOpts, Database, DatabaseConfig, DatabaseEvent,
    Did, Envelope, PubSub,
};
use accord_ledger::{passphrase_key, Ledger, MemoryLedger, TreeHandle, TreeValue};
use accord_transport::{MemoryPubSub, Subscription};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AppState {
    msg: String,
}

#[derive(Debug, Clone)]
struct AppEvent {
    msg: String,
}

fn reducer(state: &mut AppState, event: &AppEvent) {
    state.msg = event.msg.clone();
}

fn random_name() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn new_db(
    name: &str,
    ledger: Arc<dyn Ledger>,
    pubsub: Arc<MemoryPubSub>,
) -> Database<AppState, AppEvent> {
    Database::new(name, reducer, DatabaseConfig::default(), ledger, pubsub).unwrap()
}

async fn next_event(
    rx: &mut broadcast::Receiver<DatabaseEvent>,
    matches: impl FnMut(&DatabaseEvent) -> bool,
) -> DatabaseEvent {
    tokio::time::timeout(Duration::from_secs(5), wait_for(rx, matches))
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

#[tokio::test]
async fn exists_flips_on_create() {
    let ledger = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let alice = passphrase_key(b"alice", b"e2e");

    let db = new_db(&random_name(), ledger, pubsub);
    assert!(!db.exists().await.unwrap());

    db.create(&alice, CreateOpts::default()).await.unwrap();
    assert!(db.exists().await.unwrap());
}

#[tokio::test]
async fn writer_list_contains_exactly_the_granted_dids() {
    let ledger = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_did = TreeHandle::new(alice_key.clone()).did().clone();
    let bob_did = TreeHandle::new(passphrase_key(b"bob", b"e2e")).did().clone();

    let db = new_db(&random_name(), ledger, pubsub);
    db.create(
        &alice_key,
        CreateOpts {
            writers: vec![bob_did.clone(), alice_did.clone()],
            initial_state: None,
        },
    )
    .await
    .unwrap();

    let list = db.writer_list().await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.contains(&alice_did));
    assert!(list.contains(&bob_did));

    assert!(db.is_writer(&alice_did).await.unwrap());
    assert!(db.is_writer(&bob_did).await.unwrap());
    assert!(!db.is_writer(&Did::new("not a writer")).await.unwrap());
}

#[tokio::test]
async fn works_end_to_end() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());
    let bob_key = passphrase_key(b"bob", b"e2e");
    let bob_tree = TreeHandle::new(bob_key.clone());

    // Alice is the admin: she creates the database and grants both writers.
    let db_for_create = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    db_for_create
        .create(&alice_key, CreateOpts::default())
        .await
        .unwrap();
    db_for_create
        .allow_writers(
            &alice_key,
            &[alice_tree.did().clone(), bob_tree.did().clone()],
        )
        .await
        .unwrap();

    // A second instance is what a user session would hold.
    let alice_db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    let mut alice_events = alice_db.subscribe();
    alice_db.start(alice_tree).await.unwrap();
    next_event(&mut alice_events, DatabaseEvent::is_initial_sync).await;

    alice_db
        .dispatch(AppEvent {
            msg: "hi from alice".into(),
        })
        .await
        .unwrap();

    // The local read reflects the dispatch immediately.
    assert_eq!(alice_db.state().await.msg, "hi from alice");

    // The checkpoint persist completes and reports sync.
    next_event(&mut alice_events, DatabaseEvent::is_sync).await;

    // Bob starts fresh and converges on alice's state through the ledger
    // alone.
    let bob_db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    let mut bob_events = bob_db.subscribe();
    bob_db.start(bob_tree).await.unwrap();
    next_event(&mut bob_events, DatabaseEvent::is_initial_sync).await;
    assert_eq!(bob_db.state().await.msg, "hi from alice");

    // Now bob writes and alice sees it in real time over gossip.
    bob_db
        .dispatch(AppEvent {
            msg: "bob says hi back".into(),
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        next_event(&mut alice_events, DatabaseEvent::is_update).await;
        if alice_db.state().await.msg == "bob says hi back" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "alice never converged on bob's update"
        );
    }
}

#[tokio::test]
async fn initial_state_seeds_the_creator() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());

    let db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    db.create(
        &alice_key,
        CreateOpts {
            writers: vec![alice_tree.did().clone()],
            initial_state: Some(AppState {
                msg: "seeded".into(),
            }),
        },
    )
    .await
    .unwrap();

    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();
    next_event(&mut events, DatabaseEvent::is_initial_sync).await;
    assert_eq!(db.state().await.msg, "seeded");
}

#[tokio::test]
async fn local_sync_signal_precedes_full_sync() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());

    let db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    db.create(&alice_key, CreateOpts::default()).await.unwrap();

    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();

    let first = next_event(&mut events, |e| {
        e.is_initial_local_sync() || e.is_initial_sync()
    })
    .await;
    assert!(first.is_initial_local_sync());
    assert!(db.initially_loaded());

    next_event(&mut events, DatabaseEvent::is_initial_sync).await;
    assert!(db.fully_loaded());
}

#[tokio::test]
async fn dispatch_before_start_is_a_precondition_error() {
    let ledger = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());

    let db = new_db(&random_name(), ledger, pubsub);
    let err = db
        .dispatch(AppEvent { msg: "nope".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, accord_db::Error::Precondition(_)));
}

#[tokio::test]
async fn allow_writers_without_the_admin_key_is_unauthorized() {
    let ledger = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());

    let alice_key = passphrase_key(b"alice", b"e2e");
    let mallory_key = passphrase_key(b"mallory", b"e2e");
    let bob_did = TreeHandle::new(passphrase_key(b"bob", b"e2e")).did().clone();

    let db = new_db(&random_name(), ledger, pubsub);
    db.create(&alice_key, CreateOpts::default()).await.unwrap();

    let err = db.allow_writers(&mallory_key, &[bob_did]).await.unwrap_err();
    assert!(matches!(
        err,
        accord_db::Error::Ledger(accord_ledger::Error::Unauthorized(_))
    ));
}

#[tokio::test]
async fn checkpoint_lands_at_the_documented_path() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());
    let alice_did = alice_tree.did().clone();

    let db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    db.create(&alice_key, CreateOpts::default()).await.unwrap();
    db.allow_writers(&alice_key, &[alice_did.clone()])
        .await
        .unwrap();

    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();
    next_event(&mut events, DatabaseEvent::is_initial_sync).await;

    db.dispatch(AppEvent {
        msg: "persist me".into(),
    })
    .await
    .unwrap();
    let synced = next_event(&mut events, DatabaseEvent::is_sync).await;
    match synced {
        DatabaseEvent::Sync(changes) => assert!(!changes.is_empty()),
        other => panic!("unexpected event: {other:?}"),
    }

    let tip = ledger.get_tip(&alice_did).await.unwrap();
    let resolved = ledger
        .resolve_data(&tip, &checkpoint_path(db.did()))
        .await
        .unwrap();
    assert!(matches!(resolved.value, Some(TreeValue::Bytes(_))));
}

#[tokio::test]
async fn corrupt_gossip_is_rejected_with_an_event() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());

    let db = new_db(&name, Arc::clone(&ledger), Arc::clone(&pubsub));
    db.create(&alice_key, CreateOpts::default()).await.unwrap();
    db.allow_writers(&alice_key, &[alice_tree.did().clone()])
        .await
        .unwrap();

    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();
    next_event(&mut events, DatabaseEvent::is_initial_sync).await;

    db.dispatch(AppEvent { msg: "good".into() }).await.unwrap();
    assert_eq!(db.state().await.msg, "good");

    // A well-formed envelope carrying garbage change bytes is refused,
    // surfaced as an event, and the document keeps its last good state.
    let payload = Envelope::Change(ChangeSet(vec![vec![0xde, 0xad, 0xbe, 0xef]]))
        .encode()
        .unwrap();
    pubsub.publish(db.did().as_str(), payload).await.unwrap();

    let event = next_event(&mut events, DatabaseEvent::is_rejected).await;
    match event {
        DatabaseEvent::Rejected(reason) => assert!(!reason.is_empty()),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(db.state().await.msg, "good");

    // A bootstrap snapshot that is not a document gets the same treatment.
    let payload = Envelope::Bootstrap(b"not a document".to_vec())
        .encode()
        .unwrap();
    pubsub.publish(db.did().as_str(), payload).await.unwrap();

    next_event(&mut events, DatabaseEvent::is_rejected).await;
    assert_eq!(db.state().await.msg, "good");
}

/// Transport whose subscribe and publish always fail, standing in for a
/// network that is down.
struct FailingPubSub;

#[async_trait]
impl accord_transport::PubSub for FailingPubSub {
    async fn subscribe(&self, topic: &str) -> accord_transport::Result<Subscription> {
        Err(accord_transport::Error::subscribe(format!(
            "no route to {topic}"
        )))
    }

    async fn publish(&self, topic: &str, _data: Vec<u8>) -> accord_transport::Result<()> {
        Err(accord_transport::Error::publish(format!(
            "no route to {topic}"
        )))
    }
}

#[tokio::test]
async fn failed_gossip_degrades_to_ledger_only_operation() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let pubsub: Arc<dyn accord_transport::PubSub> = Arc::new(FailingPubSub);
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());

    let db: Database<AppState, AppEvent> = Database::new(
        &name,
        reducer,
        DatabaseConfig::default(),
        Arc::clone(&ledger),
        Arc::clone(&pubsub),
    )
    .unwrap();
    db.create(&alice_key, CreateOpts::default()).await.unwrap();
    db.allow_writers(&alice_key, &[alice_tree.did().clone()])
        .await
        .unwrap();

    // Start succeeds without gossip; both sync stages still complete.
    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();
    next_event(&mut events, DatabaseEvent::is_initial_sync).await;

    // Dispatch commits locally and checkpoints through the ledger even
    // though every publish fails.
    db.dispatch(AppEvent {
        msg: "offline edit".into(),
    })
    .await
    .unwrap();
    assert_eq!(db.state().await.msg, "offline edit");
    next_event(&mut events, DatabaseEvent::is_sync).await;
}

/// Ledger wrapper that hangs forever on one writer's tip lookup, standing in
/// for an unreachable peer.
struct StallingLedger {
    inner: MemoryLedger,
    stalled: Did,
}

#[async_trait]
impl Ledger for StallingLedger {
    async fn get_tip(&self, did: &Did) -> accord_ledger::Result<accord_ledger::Tip> {
        if *did == self.stalled {
            futures::future::pending::<()>().await;
        }
        self.inner.get_tip(did).await
    }

    async fn resolve_data(
        &self,
        tip: &accord_ledger::Tip,
        path: &str,
    ) -> accord_ledger::Result<accord_ledger::Resolution> {
        self.inner.resolve_data(tip, path).await
    }

    async fn play_transactions(
        &self,
        tree: &TreeHandle,
        txns: &[accord_ledger::Transaction],
    ) -> accord_ledger::Result<accord_ledger::Tip> {
        self.inner.play_transactions(tree, txns).await
    }
}

#[tokio::test]
async fn unreachable_peer_does_not_block_convergence() {
    let memory = MemoryLedger::new();
    let pubsub = Arc::new(MemoryPubSub::new());
    let name = random_name();

    let alice_key = passphrase_key(b"alice", b"e2e");
    let alice_tree = TreeHandle::new(alice_key.clone());
    let ghost_did = TreeHandle::new(passphrase_key(b"ghost", b"e2e")).did().clone();

    let ledger: Arc<dyn Ledger> = Arc::new(StallingLedger {
        inner: memory,
        stalled: ghost_did.clone(),
    });

    let config = DatabaseConfig {
        peer_sync_timeout: Duration::from_millis(100),
        ..DatabaseConfig::default()
    };
    let db: Database<AppState, AppEvent> = Database::new(
        &name,
        reducer,
        config,
        Arc::clone(&ledger),
        Arc::clone(&pubsub) as Arc<dyn accord_transport::PubSub>,
    )
    .unwrap();

    db.create(&alice_key, CreateOpts::default()).await.unwrap();
    db.allow_writers(&alice_key, &[alice_tree.did().clone(), ghost_did])
        .await
        .unwrap();

    let mut events = db.subscribe();
    db.start(alice_tree).await.unwrap();

    // The ghost writer's lookup hangs; the per-peer timeout skips it.
    next_event(&mut events, DatabaseEvent::is_initial_sync).await;
    assert!(db.fully_loaded());
}
