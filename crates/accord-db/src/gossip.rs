//! Gossip wire envelope.
//!
//! Each database instance gossips on a topic named exactly by its DID.
//! Envelopes carry either an incremental change-set or a full-document
//! bootstrap snapshot pushed to newly joined peers. Checkpoints on the
//! ledger remain the canonical catch-up path; bootstrap gossip just shortens
//! the window for peers that join mid-session.

use crate::document::ChangeSet;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A gossip message on a database topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Incremental change-set from one writer's dispatch
    Change(ChangeSet),
    /// Full saved document, pushed when a peer joins the topic
    Bootstrap(Vec<u8>),
}

impl Envelope {
    /// Encode for publishing
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::CorruptChange(e.to_string()))
    }

    /// Decode a received payload.
    ///
    /// Failure means a malformed or foreign message; callers drop it and
    /// keep serving last-good state.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::CorruptChange(e.to_string()))
    }
}
