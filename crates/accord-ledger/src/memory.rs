//! In-memory ledger used by tests and demos.

use crate::identity::{key_address, key_to_did};
use crate::ledger::Ledger;
use crate::tree::{split_path, Resolution, Tip, Transaction, TreeHandle, TreeValue};
use crate::{Did, Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct TreeState {
    owners: Vec<String>,
    data: BTreeMap<String, TreeValue>,
    version: u64,
}

/// In-process [`Ledger`] with one shared tree map.
///
/// Clones share state, so several database instances constructed with clones
/// of the same `MemoryLedger` behave like peers on one ledger.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    trees: Arc<Mutex<HashMap<Did, TreeState>>>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get_tip(&self, did: &Did) -> Result<Tip> {
        let trees = self.trees.lock().unwrap_or_else(|e| e.into_inner());
        match trees.get(did) {
            Some(tree) => Ok(Tip {
                did: did.clone(),
                version: tree.version,
            }),
            None => Err(Error::NotFound(did.clone())),
        }
    }

    async fn resolve_data(&self, tip: &Tip, path: &str) -> Result<Resolution> {
        let trees = self.trees.lock().unwrap_or_else(|e| e.into_inner());
        let tree = trees
            .get(&tip.did)
            .ok_or_else(|| Error::NotFound(tip.did.clone()))?;

        let mut segments = split_path(path);
        let mut current = &tree.data;
        while !segments.is_empty() {
            let segment = segments.remove(0);
            match current.get(&segment) {
                Some(value) if segments.is_empty() => {
                    return Ok(Resolution {
                        value: Some(value.clone()),
                        remainder_path: vec![],
                    });
                }
                Some(TreeValue::Map(child)) => current = child,
                Some(_) | None => {
                    let mut remainder = vec![segment];
                    remainder.extend(segments);
                    return Ok(Resolution {
                        value: None,
                        remainder_path: remainder,
                    });
                }
            }
        }
        // Empty path resolves to the tree root
        Ok(Resolution {
            value: Some(TreeValue::Map(tree.data.clone())),
            remainder_path: vec![],
        })
    }

    async fn play_transactions(&self, handle: &TreeHandle, txns: &[Transaction]) -> Result<Tip> {
        let key = handle
            .key()
            .ok_or_else(|| Error::missing_key(format!("tree {} has no signing key", handle.did())))?;
        let address = key_address(&key.verifying_key());

        let mut trees = self.trees.lock().unwrap_or_else(|e| e.into_inner());
        if !trees.contains_key(handle.did()) {
            // Genesis: only the key whose native DID matches may create
            if key_to_did(&key.verifying_key()) != *handle.did() {
                return Err(Error::unauthorized(format!(
                    "{address} cannot create tree {}",
                    handle.did()
                )));
            }
            trees.insert(
                handle.did().clone(),
                TreeState {
                    owners: vec![address.clone()],
                    data: BTreeMap::new(),
                    version: 0,
                },
            );
        }
        let tree = trees
            .get_mut(handle.did())
            .ok_or_else(|| Error::NotFound(handle.did().clone()))?;
        if !tree.owners.contains(&address) {
            return Err(Error::unauthorized(format!(
                "{address} does not own {}",
                handle.did()
            )));
        }

        for txn in txns {
            match txn {
                Transaction::SetData { path, value } => {
                    set_path(&mut tree.data, &split_path(path), value)?;
                }
                Transaction::SetOwnership { addresses } => {
                    tree.owners = addresses.clone();
                }
            }
        }
        tree.version += 1;
        tracing::debug!(did = %handle.did(), version = tree.version, txns = txns.len(), "played transactions");
        Ok(Tip {
            did: handle.did().clone(),
            version: tree.version,
        })
    }
}

fn set_path(map: &mut BTreeMap<String, TreeValue>, segments: &[String], value: &TreeValue) -> Result<()> {
    match segments {
        [] => Err(Error::invalid_transaction("empty path in SetData")),
        [leaf] => {
            map.insert(leaf.clone(), value.clone());
            Ok(())
        }
        [head, rest @ ..] => {
            let child = map
                .entry(head.clone())
                .or_insert_with(|| TreeValue::Map(BTreeMap::new()));
            // A scalar in the middle of the path is overwritten by a subtree
            if !matches!(child, TreeValue::Map(_)) {
                *child = TreeValue::Map(BTreeMap::new());
            }
            match child {
                TreeValue::Map(child_map) => set_path(child_map, rest, value),
                _ => Err(Error::invalid_transaction("corrupt tree node")),
            }
        }
    }
}
