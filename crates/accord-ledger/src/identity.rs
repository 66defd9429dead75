//! Deterministic key and DID derivation.
//!
//! Writers and databases are addressed by DIDs derived from ed25519 public
//! keys. Database keys are in turn derived from a passphrase (the database
//! name) under an application namespace, so every replica arrives at the
//! same database DID without coordination.

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Decentralized identifier for a writer or database.
///
/// Derived deterministically from a public key; doubles as the CRDT actor id
/// for that writer's edits and as the pub/sub and ledger addressing key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did(String);

impl Did {
    /// Wrap an already-derived DID string.
    ///
    /// Prefer [`key_to_did`] when a key is at hand; this is for DIDs read
    /// back from the ledger or received over the wire.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The DID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Derive a signing key from a passphrase under a namespace.
///
/// The same (namespace, phrase) pair always yields the same key, which is
/// what lets every replica of a named database derive the database's own
/// tree key locally. The key is only as secret as the phrase; database name
/// keys are not secrets (ownership is transferred to the admin on create).
pub fn passphrase_key(phrase: &[u8], namespace: &[u8]) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(namespace);
    hasher.update([0x1f]);
    hasher.update(phrase);
    let seed: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&seed)
}

/// Derive the DID for a public key
pub fn key_to_did(key: &VerifyingKey) -> Did {
    let digest = Sha256::digest(key.as_bytes());
    Did(format!("did:accord:{}", hex::encode(digest)))
}

/// Derive the ownership address for a public key.
///
/// Addresses are what tree owner lists hold; they are shorter than DIDs but
/// derived from the same key material.
pub fn key_address(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..20])
}
