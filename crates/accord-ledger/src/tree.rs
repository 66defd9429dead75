//! Tree handles, values, transactions, and resolution results.

use crate::identity::{key_to_did, Did};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tip anchors the current version of a tree in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tip {
    /// DID of the tree this tip belongs to
    pub did: Did,
    /// Monotonically increasing tree version
    pub version: u64,
}

/// A value stored at a tree path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeValue {
    /// Absent / explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer (timestamps, counters)
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Opaque bytes (document checkpoints)
    Bytes(Vec<u8>),
    /// Nested map of child paths
    Map(BTreeMap<String, TreeValue>),
}

impl TreeValue {
    /// Borrow the bytes payload, if this is a bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the map payload, if this is a map value
    pub fn as_map(&self) -> Option<&BTreeMap<String, TreeValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Result of resolving a path against a tree.
///
/// `remainder_path` holds the path segments that could not be walked; it is
/// empty on an exact hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The value at the resolved path, if the full path existed
    pub value: Option<TreeValue>,
    /// Path segments left unresolved
    pub remainder_path: Vec<String>,
}

/// A transaction to play against a tree
#[derive(Debug, Clone)]
pub enum Transaction {
    /// Set the value at a path, creating intermediate maps as needed
    SetData {
        /// Slash-separated path under the tree root
        path: String,
        /// Value to store
        value: TreeValue,
    },
    /// Replace the tree's owner list
    SetOwnership {
        /// Addresses (see [`crate::key_address`]) allowed to sign transactions
        addresses: Vec<String>,
    },
}

/// Process-local handle to a ledger tree: its DID plus an optional signing
/// key for playing transactions.
#[derive(Clone)]
pub struct TreeHandle {
    did: Did,
    key: Option<SigningKey>,
}

impl TreeHandle {
    /// Handle for the tree a key natively anchors (DID derived from the key)
    pub fn new(key: SigningKey) -> Self {
        let did = key_to_did(&key.verifying_key());
        Self {
            did,
            key: Some(key),
        }
    }

    /// Handle for an existing tree signed by a (possibly non-native) key,
    /// e.g. an admin key that was granted ownership of a database tree
    pub fn with_key(did: Did, key: SigningKey) -> Self {
        Self {
            did,
            key: Some(key),
        }
    }

    /// Read-only handle: can be resolved against but cannot sign
    /// transactions
    pub fn read_only(did: Did) -> Self {
        Self { did, key: None }
    }

    /// DID of the tree
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Signing key, when this handle can write
    pub fn key(&self) -> Option<&SigningKey> {
        self.key.as_ref()
    }
}

impl std::fmt::Debug for TreeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeHandle")
            .field("did", &self.did)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

/// Split a slash-separated path into non-empty segments
pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
