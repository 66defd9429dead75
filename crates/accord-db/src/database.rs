//! The database handle: construction, create/start lifecycle, dispatch,
//! writer administration, and the two-stage initial convergence.

use crate::checkpoint::{read_checkpoint, CheckpointWriter};
use crate::document::{ChangeSet, StateDoc};
use crate::events::{DatabaseEvent, EventBus};
use crate::gossip::Envelope;
use crate::writers;
use crate::{Error, Result};
use accord_ledger::{
    key_address, key_to_did, passphrase_key, Did, Ledger, Transaction, TreeHandle, TreeValue,
};
use accord_transport::{PeerEvent, PubSub, Subscription};
use ed25519_dalek::SigningKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Pure state-transition function applied to every dispatched action.
///
/// Reducers mutate the state in place and return nothing; a reducer that
/// panics aborts only that one mutation, leaving committed state untouched.
pub trait Reducer<S, A>: Send + Sync {
    /// Apply one action to the state
    fn reduce(&self, state: &mut S, action: &A);
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(&mut S, &A) + Send + Sync,
{
    fn reduce(&self, state: &mut S, action: &A) {
        self(state, action);
    }
}

/// Construction-time configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Application namespace; databases with the same name in different
    /// namespaces are unrelated
    pub namespace: Vec<u8>,
    /// Budget for fetching one peer's checkpoint during initial convergence;
    /// a peer that exceeds it is skipped like a peer with no checkpoint
    pub peer_sync_timeout: Duration,
    /// Undelivered events retained per subscriber
    pub event_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            namespace: b"accord".to_vec(),
            peer_sync_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

/// Options for [`Database::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOpts<S> {
    /// DIDs granted write access at creation time
    pub writers: Vec<Did>,
    /// Starting value for the document
    pub initial_state: Option<S>,
}

struct Flags {
    started: AtomicBool,
    initially_loaded: AtomicBool,
    fully_loaded: AtomicBool,
}

struct Shared<S> {
    doc: StateDoc<S>,
    writer: Option<TreeHandle>,
}

/// A peer-replicated, CRDT-backed key-state database.
///
/// One instance per process per database; replicas in other processes
/// converge through the ledger and the gossip topic, never shared memory.
/// The ledger and transport are injected, so independent instances (and
/// tests) never interfere through global state.
pub struct Database<S, A> {
    name: String,
    did: Did,
    config: DatabaseConfig,
    reducer: Arc<dyn Reducer<S, A>>,
    ledger: Arc<dyn Ledger>,
    pubsub: Arc<dyn PubSub>,
    events: EventBus,
    inner: Arc<Mutex<Shared<S>>>,
    checkpoints: CheckpointWriter,
    flags: Arc<Flags>,
    peer_count: Arc<AtomicUsize>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    _action: PhantomData<fn(A)>,
}

impl<S, A> Database<S, A>
where
    S: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
    A: 'static,
{
    /// Create a database handle.
    ///
    /// The database DID derives deterministically from the name under the
    /// configured namespace, so every replica addresses the same tree and
    /// gossip topic without coordination. The handle does nothing until
    /// [`Self::create`] or [`Self::start`] is called.
    pub fn new(
        name: impl Into<String>,
        reducer: impl Reducer<S, A> + 'static,
        config: DatabaseConfig,
        ledger: Arc<dyn Ledger>,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self> {
        let name = name.into();
        let db_key = passphrase_key(name.as_bytes(), &config.namespace);
        let did = key_to_did(&db_key.verifying_key());
        let events = EventBus::new(config.event_capacity);
        let doc = StateDoc::new(&did, None)?;
        let checkpoints = CheckpointWriter::new(Arc::clone(&ledger), did.clone(), events.clone());

        Ok(Self {
            name,
            did,
            config,
            reducer: Arc::new(reducer),
            ledger,
            pubsub,
            events,
            inner: Arc::new(Mutex::new(Shared { doc, writer: None })),
            checkpoints,
            flags: Arc::new(Flags {
                started: AtomicBool::new(false),
                initially_loaded: AtomicBool::new(false),
                fully_loaded: AtomicBool::new(false),
            }),
            peer_count: Arc::new(AtomicUsize::new(0)),
            tasks: StdMutex::new(Vec::new()),
            _action: PhantomData,
        })
    }

    /// The database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database DID (also the gossip topic)
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Subscribe to this instance's events
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.events.subscribe()
    }

    /// Clone of the current state snapshot.
    ///
    /// Reflects every locally dispatched action as soon as the dispatch
    /// call returns; remote changes appear as they are applied.
    pub async fn state(&self) -> S {
        self.inner.lock().await.doc.state().clone()
    }

    /// Whether the database tree exists on the ledger
    pub async fn exists(&self) -> Result<bool> {
        match self.ledger.get_tip(&self.did).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Create the database on the ledger (admin path).
    ///
    /// Anchors the database tree, hands its ownership to the admin key,
    /// grants the given writers, and seeds the local document with the
    /// initial state if one is supplied.
    pub async fn create(&self, admin_key: &SigningKey, opts: CreateOpts<S>) -> Result<()> {
        if self.flags.started.load(Ordering::SeqCst) {
            return Err(Error::precondition("create called on a started database"));
        }

        let db_key = passphrase_key(self.name.as_bytes(), &self.config.namespace);
        let db_tree = TreeHandle::new(db_key);

        let mut txns = vec![Transaction::SetOwnership {
            addresses: vec![key_address(&admin_key.verifying_key())],
        }];
        let now = unix_now();
        for did in &opts.writers {
            txns.push(Transaction::SetData {
                path: format!("{}/{did}", writers::WRITERS_PATH),
                value: TreeValue::Int(now),
            });
        }
        self.ledger.play_transactions(&db_tree, &txns).await?;
        tracing::debug!(db = %self.did, writers = opts.writers.len(), "database created");

        if let Some(initial) = &opts.initial_state {
            let mut guard = self.inner.lock().await;
            guard.doc = StateDoc::new(&self.did, Some(initial))?;
        }
        Ok(())
    }

    /// Grant write access to the given DIDs; requires the admin key
    pub async fn allow_writers(&self, admin_key: &SigningKey, dids: &[Did]) -> Result<()> {
        let db_tree = TreeHandle::with_key(self.did.clone(), admin_key.clone());
        writers::allow_writers(self.ledger.as_ref(), &db_tree, dids).await
    }

    /// The authorized writer list
    pub async fn writer_list(&self) -> Result<Vec<Did>> {
        writers::writer_list(self.ledger.as_ref(), &self.did).await
    }

    /// Whether a DID is an authorized writer
    pub async fn is_writer(&self, did: &Did) -> Result<bool> {
        writers::is_writer(self.ledger.as_ref(), &self.did, did).await
    }

    /// Start the database as the given writer (regular member path).
    ///
    /// Loads the writer's own checkpoint first and emits `InitialLocalSync`
    /// (usable state, one local ledger read away), subscribes to gossip,
    /// then converges on the other writers' checkpoints in the background
    /// and emits `InitialSync` when done. Best-effort: an unreachable peer
    /// is skipped, never fatal.
    pub async fn start(&self, writer: TreeHandle) -> Result<()> {
        if writer.key().is_none() {
            return Err(Error::precondition("start requires a writer tree with a signing key"));
        }
        if self.flags.started.swap(true, Ordering::SeqCst) {
            return Err(Error::precondition("database already started"));
        }

        let writer_did = writer.did().clone();
        {
            let mut guard = self.inner.lock().await;
            guard.doc.set_actor(&writer_did);
            guard.writer = Some(writer);
        }

        // Stage one: our own last checkpoint, no peer round-trips.
        match read_checkpoint(self.ledger.as_ref(), &writer_did, &self.did).await {
            Ok(Some(snapshot)) => {
                let mut guard = self.inner.lock().await;
                if let Err(err) = guard.doc.merge(&snapshot) {
                    tracing::warn!(db = %self.did, %err, "local checkpoint rejected");
                    drop(guard);
                    self.events.emit(DatabaseEvent::Rejected(err.to_string()));
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(db = %self.did, %err, "local checkpoint read failed"),
        }
        self.flags.initially_loaded.store(true, Ordering::SeqCst);
        self.events.emit(DatabaseEvent::InitialLocalSync);

        // Subscribe before converging so no live update is missed. A failed
        // subscription degrades to ledger-only operation.
        match self.pubsub.subscribe(self.did.as_str()).await {
            Ok(subscription) => {
                let handle = tokio::spawn(listen(
                    subscription,
                    Arc::clone(&self.inner),
                    self.events.clone(),
                    Arc::clone(&self.peer_count),
                    Arc::clone(&self.pubsub),
                    self.did.clone(),
                ));
                self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
            }
            Err(err) => {
                tracing::error!(db = %self.did, %err, "gossip subscription failed; live updates disabled");
            }
        }

        // Stage two: fold in every other writer's checkpoint.
        let handle = tokio::spawn(converge(
            Arc::clone(&self.ledger),
            self.did.clone(),
            writer_did,
            self.config.peer_sync_timeout,
            Arc::clone(&self.inner),
            self.events.clone(),
            Arc::clone(&self.flags),
        ));
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(handle);

        Ok(())
    }

    /// Apply an action to the local document.
    ///
    /// The state visible through [`Self::state`] reflects the action when
    /// this returns. The resulting change-set is published to the gossip
    /// topic and the snapshot is queued for checkpoint persistence; neither
    /// outcome affects the already-committed local mutation (local-first).
    pub async fn dispatch(&self, action: A) -> Result<()> {
        if !self.flags.started.load(Ordering::SeqCst) {
            return Err(Error::precondition("dispatch before start"));
        }

        let (changes, snapshot, writer) = {
            let mut guard = self.inner.lock().await;
            let writer = guard
                .writer
                .clone()
                .ok_or_else(|| Error::precondition("dispatch without a writer identity"))?;
            let reducer = Arc::clone(&self.reducer);
            let changes = guard.doc.mutate(|state| reducer.reduce(state, &action))?;
            if changes.is_empty() {
                return Ok(());
            }
            (changes, guard.doc.save(), writer)
        };

        self.events.emit(DatabaseEvent::Update(changes.clone()));

        let pubsub = Arc::clone(&self.pubsub);
        let topic = self.did.clone();
        let envelope = Envelope::Change(changes.clone());
        tokio::spawn(async move {
            publish_envelope(pubsub.as_ref(), topic.as_str(), &envelope).await;
        });

        self.checkpoints.persist(writer, snapshot, changes);
        Ok(())
    }

    /// Live subscriber count on the gossip topic, excluding this instance
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::SeqCst)
    }

    /// Whether `start` has been called
    pub fn started(&self) -> bool {
        self.flags.started.load(Ordering::SeqCst)
    }

    /// Whether the local checkpoint stage has completed
    pub fn initially_loaded(&self) -> bool {
        self.flags.initially_loaded.load(Ordering::SeqCst)
    }

    /// Whether full peer convergence has completed
    pub fn fully_loaded(&self) -> bool {
        self.flags.fully_loaded.load(Ordering::SeqCst)
    }

    /// Stop background work (gossip listener, pending convergence).
    ///
    /// The in-memory state stays readable; dispatch fails afterwards.
    pub fn stop(&self) {
        self.flags.started.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl<S, A> Drop for Database<S, A> {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fold every other writer's checkpoint into the local document, then
/// report full convergence. Partial failure is expected: unreachable or
/// checkpoint-less peers are skipped.
async fn converge<S>(
    ledger: Arc<dyn Ledger>,
    db_did: Did,
    local_writer: Did,
    per_peer_timeout: Duration,
    inner: Arc<Mutex<Shared<S>>>,
    events: EventBus,
    flags: Arc<Flags>,
) where
    S: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    // The writer list is read once; a writer granted mid-sync converges
    // later via gossip or the next start.
    let writer_dids = match writers::writer_list(ledger.as_ref(), &db_did).await {
        Ok(dids) => dids,
        Err(err) => {
            tracing::warn!(db = %db_did, %err, "writer list unavailable; converging without peers");
            Vec::new()
        }
    };

    for writer_did in writer_dids.iter().filter(|did| **did != local_writer) {
        let fetched = tokio::time::timeout(
            per_peer_timeout,
            read_checkpoint(ledger.as_ref(), writer_did, &db_did),
        )
        .await;
        match fetched {
            Ok(Ok(Some(snapshot))) => {
                let mut guard = inner.lock().await;
                if let Err(err) = guard.doc.merge(&snapshot) {
                    tracing::warn!(db = %db_did, writer = %writer_did, %err, "peer checkpoint rejected");
                    drop(guard);
                    events.emit(DatabaseEvent::Rejected(err.to_string()));
                }
            }
            Ok(Ok(None)) => {
                tracing::debug!(db = %db_did, writer = %writer_did, "peer has no checkpoint yet");
            }
            Ok(Err(err @ Error::CorruptCheckpoint(_))) => {
                tracing::warn!(db = %db_did, writer = %writer_did, %err, "peer checkpoint rejected");
                events.emit(DatabaseEvent::Rejected(err.to_string()));
            }
            Ok(Err(err)) => {
                tracing::warn!(db = %db_did, writer = %writer_did, %err, "peer checkpoint read failed");
            }
            Err(_) => {
                tracing::debug!(db = %db_did, writer = %writer_did, "peer checkpoint read timed out");
            }
        }
    }

    flags.fully_loaded.store(true, Ordering::SeqCst);
    events.emit(DatabaseEvent::InitialSync);
}

/// Drive a gossip subscription: apply change and bootstrap envelopes,
/// track peer membership, and push a bootstrap snapshot to joiners.
async fn listen<S>(
    mut subscription: Subscription,
    inner: Arc<Mutex<Shared<S>>>,
    events: EventBus,
    peer_count: Arc<AtomicUsize>,
    pubsub: Arc<dyn PubSub>,
    topic: Did,
) where
    S: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    let mut peers_open = true;
    loop {
        tokio::select! {
            message = subscription.messages.recv() => match message {
                Some(bytes) => handle_message(&bytes, &inner, &events, &topic).await,
                None => break,
            },
            peer = subscription.peer_events.recv(), if peers_open => match peer {
                Some(PeerEvent::Joined) => {
                    peer_count.fetch_add(1, Ordering::SeqCst);
                    let snapshot = { inner.lock().await.doc.save() };
                    publish_envelope(pubsub.as_ref(), topic.as_str(), &Envelope::Bootstrap(snapshot)).await;
                }
                Some(PeerEvent::Left) => {
                    let _ = peer_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    });
                }
                None => peers_open = false,
            },
        }
    }
    tracing::debug!(db = %topic, "gossip listener stopped");
}

async fn handle_message<S>(
    bytes: &[u8],
    inner: &Arc<Mutex<Shared<S>>>,
    events: &EventBus,
    topic: &Did,
) where
    S: Serialize + DeserializeOwned + Default + Clone + Send + 'static,
{
    match Envelope::decode(bytes) {
        Ok(Envelope::Change(changes)) => {
            let mut guard = inner.lock().await;
            match guard.doc.apply_changes(&changes) {
                Ok(true) => {
                    drop(guard);
                    events.emit(DatabaseEvent::Update(changes));
                }
                // Already seen (including our own messages echoed back).
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(db = %topic, %err, "rejected remote change-set");
                    drop(guard);
                    events.emit(DatabaseEvent::Rejected(err.to_string()));
                }
            }
        }
        Ok(Envelope::Bootstrap(snapshot)) => {
            let mut guard = inner.lock().await;
            match guard.doc.merge(&snapshot) {
                Ok(true) => {
                    drop(guard);
                    events.emit(DatabaseEvent::Update(ChangeSet::empty()));
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(db = %topic, %err, "rejected bootstrap snapshot");
                    drop(guard);
                    events.emit(DatabaseEvent::Rejected(err.to_string()));
                }
            }
        }
        Err(err) => {
            tracing::warn!(db = %topic, %err, "undecodable gossip message dropped");
            events.emit(DatabaseEvent::Rejected(err.to_string()));
        }
    }
}

/// Publish an envelope, logging failure. Local state is authoritative for
/// the local writer regardless of network success; no retry, no rollback.
async fn publish_envelope(pubsub: &dyn PubSub, topic: &str, envelope: &Envelope) {
    let payload = match envelope.encode() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(topic, %err, "envelope encoding failed");
            return;
        }
    };
    if let Err(err) = pubsub.publish(topic, payload).await {
        tracing::warn!(topic, %err, "gossip publish failed");
    }
}
