//! CRDT state container.
//!
//! Wraps an Automerge document tagged with the writer's DID as actor id and
//! bridges it to a typed application state `S`. Reads hydrate the document
//! into `S` through `serde_json::Value`; mutations run a reducer against a
//! copy of the current state and write only the differing paths back into
//! the document in a single transaction, so the change-set published to
//! peers stays minimal.

use crate::{Error, Result};
use accord_ledger::Did;
use automerge::transaction::Transactable;
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// An ordered, serializable sequence of raw Automerge change blobs.
///
/// Applying a change-set is idempotent; applying concurrent change-sets is
/// commutative. Both properties come from Automerge's causal bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet(pub Vec<Vec<u8>>);

impl ChangeSet {
    /// A change-set with no changes
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of changes carried
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no changes are carried
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A typed CRDT document owned by one database instance.
///
/// `S` must be `Default` so that fields absent from the document (a fresh
/// database, or state written by an older schema) fall back to their
/// defaults instead of failing hydration.
pub struct StateDoc<S> {
    doc: AutoCommit,
    cache: S,
}

impl<S> StateDoc<S>
where
    S: Serialize + DeserializeOwned + Default + Clone,
{
    /// Create a fresh document tagged with the actor's DID, optionally
    /// seeded with a starting value (written as one transaction).
    pub fn new(actor: &Did, initial: Option<&S>) -> Result<Self> {
        let mut doc = AutoCommit::new().with_actor(actor_id(actor));
        if let Some(state) = initial {
            let target = serde_json::to_value(state).map_err(Error::state)?;
            reconcile(&mut doc, &Json::Object(serde_json::Map::new()), &target)?;
            doc.commit();
        }
        let cache = hydrate(&doc)?;
        Ok(Self { doc, cache })
    }

    /// Re-tag the document with a new actor id for subsequent edits.
    ///
    /// Called when a writer identity becomes known after construction;
    /// changes already made keep their original actor.
    pub fn set_actor(&mut self, actor: &Did) {
        self.doc.set_actor(actor_id(actor));
    }

    /// The current state snapshot. Always coherent: it is recomputed after
    /// every committed mutation, merge, and change application.
    pub fn state(&self) -> &S {
        &self.cache
    }

    /// Apply a reducer to the current state and commit the difference.
    ///
    /// The reducer mutates a copy; nothing touches the document until it
    /// returns, so a panicking reducer aborts only its own mutation and the
    /// committed state stays intact. Returns the changes added by this
    /// mutation (possibly empty if the reducer changed nothing).
    pub fn mutate(&mut self, reduce: impl FnOnce(&mut S)) -> Result<ChangeSet> {
        let before = self.doc.get_heads();

        let mut next = self.cache.clone();
        reduce(&mut next);

        let old = to_json(&self.doc)?;
        let new = serde_json::to_value(&next).map_err(Error::state)?;
        reconcile(&mut self.doc, &old, &new)?;
        self.doc.commit();

        self.cache = hydrate(&self.doc)?;
        Ok(self.changes_since(&before))
    }

    /// Merge a saved remote document (checkpoint) into this one.
    ///
    /// Merging is associative and commutative, so checkpoints can be folded
    /// in any order. Returns true when the merge changed this document.
    pub fn merge(&mut self, saved: &[u8]) -> Result<bool> {
        let mut remote =
            AutoCommit::load(saved).map_err(|e| Error::CorruptCheckpoint(e.to_string()))?;
        let before = self.doc.get_heads();
        self.doc.merge(&mut remote).map_err(Error::crdt)?;
        let changed = self.doc.get_heads() != before;
        if changed {
            self.cache = hydrate(&self.doc)?;
        }
        Ok(changed)
    }

    /// Apply a remote change-set.
    ///
    /// Decoding is all-or-nothing: if any blob is malformed the whole set is
    /// rejected and the document is untouched. Changes already seen are
    /// skipped (idempotent); changes whose dependencies are unknown are
    /// queued internally by Automerge until they arrive, which makes
    /// unrelated-history input a safe no-op rather than corruption. Returns
    /// true when the document changed.
    pub fn apply_changes(&mut self, changes: &ChangeSet) -> Result<bool> {
        let decoded = changes
            .0
            .iter()
            .map(|raw| {
                automerge::Change::from_bytes(raw.clone())
                    .map_err(|e| Error::CorruptChange(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let before = self.doc.get_heads();
        self.doc.apply_changes(decoded).map_err(Error::crdt)?;
        let changed = self.doc.get_heads() != before;
        if changed {
            self.cache = hydrate(&self.doc)?;
        }
        Ok(changed)
    }

    /// Serialize the full document (checkpoint payload)
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Changes added since the given heads
    fn changes_since(&mut self, heads: &[automerge::ChangeHash]) -> ChangeSet {
        let raw = self
            .doc
            .get_changes(heads)
            .into_iter()
            .map(|c| c.raw_bytes().to_vec())
            .collect();
        ChangeSet(raw)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for StateDoc<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDoc").field("state", &self.cache).finish()
    }
}

fn actor_id(did: &Did) -> ActorId {
    ActorId::from(did.as_str().as_bytes())
}

/// Hydrate the document into `S`, overlaying document values onto the
/// serde defaults of `S` so missing fields do not fail deserialization.
fn hydrate<S: DeserializeOwned + Default + Serialize>(doc: &AutoCommit) -> Result<S> {
    let from_doc = to_json(doc)?;
    let base = serde_json::to_value(S::default()).map_err(Error::state)?;
    let merged = overlay(base, from_doc);
    serde_json::from_value(merged).map_err(Error::state)
}

/// Deep-merge `from_doc` over `base`: objects merge per key, everything
/// else is taken from the document.
fn overlay(base: Json, from_doc: Json) -> Json {
    match (base, from_doc) {
        (Json::Object(mut base_map), Json::Object(doc_map)) => {
            for (key, doc_val) in doc_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => overlay(base_val, doc_val),
                    None => doc_val,
                };
                base_map.insert(key, merged);
            }
            Json::Object(base_map)
        }
        (_, doc_val) => doc_val,
    }
}

/// Read the whole document as a JSON value (root is always an object)
fn to_json(doc: &AutoCommit) -> Result<Json> {
    read_map(doc, &ROOT)
}

fn read_map(doc: &AutoCommit, obj: &ObjId) -> Result<Json> {
    let mut out = serde_json::Map::new();
    for key in doc.keys(obj) {
        if let Some((value, id)) = doc.get(obj, key.as_str()).map_err(Error::crdt)? {
            out.insert(key, read_value(doc, &value, &id)?);
        }
    }
    Ok(Json::Object(out))
}

fn read_list(doc: &AutoCommit, obj: &ObjId) -> Result<Json> {
    let len = doc.length(obj);
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        if let Some((value, id)) = doc.get(obj, i).map_err(Error::crdt)? {
            out.push(read_value(doc, &value, &id)?);
        }
    }
    Ok(Json::Array(out))
}

fn read_value(doc: &AutoCommit, value: &Value<'_>, id: &ObjId) -> Result<Json> {
    match value {
        Value::Object(ObjType::Map) | Value::Object(ObjType::Table) => read_map(doc, id),
        Value::Object(ObjType::List) => read_list(doc, id),
        Value::Object(ObjType::Text) => Ok(Json::String(doc.text(id).map_err(Error::crdt)?)),
        Value::Scalar(scalar) => Ok(scalar_to_json(scalar.as_ref())),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Json {
    match scalar {
        ScalarValue::Null => Json::Null,
        ScalarValue::Boolean(b) => Json::Bool(*b),
        ScalarValue::Int(i) => Json::from(*i),
        ScalarValue::Uint(u) => Json::from(*u),
        ScalarValue::Timestamp(t) => Json::from(*t),
        ScalarValue::F64(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        ScalarValue::Str(s) => Json::String(s.to_string()),
        other => {
            // Counters, bytes, unknown: not produced by this container
            tracing::debug!(?other, "unrepresentable scalar hydrated as null");
            Json::Null
        }
    }
}

/// Write the difference between two JSON snapshots into the document,
/// starting at the root object.
fn reconcile(doc: &mut AutoCommit, old: &Json, new: &Json) -> Result<()> {
    match (old, new) {
        (Json::Object(old_map), Json::Object(new_map)) => {
            diff_map(doc, &ROOT, old_map, new_map)
        }
        _ => Err(Error::state("application state must serialize to a JSON object")),
    }
}

fn diff_map(
    doc: &mut AutoCommit,
    obj: &ObjId,
    old: &serde_json::Map<String, Json>,
    new: &serde_json::Map<String, Json>,
) -> Result<()> {
    for key in old.keys() {
        if !new.contains_key(key) {
            doc.delete(obj, key.as_str()).map_err(Error::crdt)?;
        }
    }
    for (key, new_val) in new {
        match old.get(key) {
            Some(old_val) if old_val == new_val => {}
            Some(old_val) => {
                diff_entry(doc, obj, Slot::Key(key.as_str()), Some(old_val), new_val)?;
            }
            None => diff_entry(doc, obj, Slot::Key(key.as_str()), None, new_val)?,
        }
    }
    Ok(())
}

fn diff_list(doc: &mut AutoCommit, obj: &ObjId, old: &[Json], new: &[Json]) -> Result<()> {
    let common = old.len().min(new.len());
    for i in 0..common {
        if old[i] != new[i] {
            diff_entry(doc, obj, Slot::Index(i), Some(&old[i]), &new[i])?;
        }
    }
    for (i, item) in new.iter().enumerate().skip(common) {
        insert_value(doc, obj, i, item)?;
    }
    for i in (new.len()..old.len()).rev() {
        doc.delete(obj, i).map_err(Error::crdt)?;
    }
    Ok(())
}

/// Where a value sits inside its parent object
enum Slot<'a> {
    Key(&'a str),
    Index(usize),
}

/// Shape of the document node currently occupying a slot
enum ChildKind {
    Map(ObjId),
    List(ObjId),
    Other,
}

/// Reconcile one differing slot: recurse into same-shaped containers,
/// otherwise replace the slot wholesale.
fn diff_entry(
    doc: &mut AutoCommit,
    obj: &ObjId,
    slot: Slot<'_>,
    old: Option<&Json>,
    new: &Json,
) -> Result<()> {
    if let Some(old) = old {
        // Extract the child's shape into an owned value so the read borrow
        // ends before we mutate.
        let child = {
            let found = match &slot {
                Slot::Key(k) => doc.get(obj, *k).map_err(Error::crdt)?,
                Slot::Index(i) => doc.get(obj, *i).map_err(Error::crdt)?,
            };
            match found {
                Some((Value::Object(ObjType::Map), id)) => ChildKind::Map(id),
                Some((Value::Object(ObjType::List), id)) => ChildKind::List(id),
                _ => ChildKind::Other,
            }
        };
        match (old, new, child) {
            (Json::Object(om), Json::Object(nm), ChildKind::Map(id)) => {
                return diff_map(doc, &id, om, nm);
            }
            (Json::Array(oa), Json::Array(na), ChildKind::List(id)) => {
                return diff_list(doc, &id, oa, na);
            }
            _ => {}
        }
    }
    put_value(doc, obj, &slot, new)
}

/// Put a JSON value at a slot, replacing whatever was there
fn put_value(doc: &mut AutoCommit, obj: &ObjId, slot: &Slot<'_>, value: &Json) -> Result<()> {
    match value {
        Json::Object(map) => {
            let id = match slot {
                Slot::Key(k) => doc.put_object(obj, *k, ObjType::Map),
                Slot::Index(i) => doc.put_object(obj, *i, ObjType::Map),
            }
            .map_err(Error::crdt)?;
            fill_map(doc, &id, map)
        }
        Json::Array(items) => {
            let id = match slot {
                Slot::Key(k) => doc.put_object(obj, *k, ObjType::List),
                Slot::Index(i) => doc.put_object(obj, *i, ObjType::List),
            }
            .map_err(Error::crdt)?;
            fill_list(doc, &id, items)
        }
        scalar => {
            let scalar = json_to_scalar(scalar)?;
            match slot {
                Slot::Key(k) => doc.put(obj, *k, scalar),
                Slot::Index(i) => doc.put(obj, *i, scalar),
            }
            .map_err(Error::crdt)
        }
    }
}

/// Insert a JSON value at a list index
fn insert_value(doc: &mut AutoCommit, obj: &ObjId, index: usize, value: &Json) -> Result<()> {
    match value {
        Json::Object(map) => {
            let id = doc
                .insert_object(obj, index, ObjType::Map)
                .map_err(Error::crdt)?;
            fill_map(doc, &id, map)
        }
        Json::Array(items) => {
            let id = doc
                .insert_object(obj, index, ObjType::List)
                .map_err(Error::crdt)?;
            fill_list(doc, &id, items)
        }
        scalar => doc
            .insert(obj, index, json_to_scalar(scalar)?)
            .map_err(Error::crdt),
    }
}

fn fill_map(doc: &mut AutoCommit, obj: &ObjId, map: &serde_json::Map<String, Json>) -> Result<()> {
    for (key, val) in map {
        put_value(doc, obj, &Slot::Key(key.as_str()), val)?;
    }
    Ok(())
}

fn fill_list(doc: &mut AutoCommit, obj: &ObjId, items: &[Json]) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        insert_value(doc, obj, i, item)?;
    }
    Ok(())
}

fn json_to_scalar(value: &Json) -> Result<ScalarValue> {
    match value {
        Json::Null => Ok(ScalarValue::Null),
        Json::Bool(b) => Ok(ScalarValue::Boolean(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ScalarValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(ScalarValue::Uint(u))
            } else {
                Ok(ScalarValue::F64(n.as_f64().unwrap_or(0.0)))
            }
        }
        Json::String(s) => Ok(ScalarValue::Str(s.as_str().into())),
        Json::Object(_) | Json::Array(_) => {
            Err(Error::state("containers cannot be written as scalars"))
        }
    }
}
