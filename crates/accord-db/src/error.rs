//! Error types for the database core.

use thiserror::Error;

/// Database error types
#[derive(Debug, Error)]
pub enum Error {
    /// The call was made in a state that cannot serve it (e.g. dispatch
    /// before start). Never corrupts existing state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A queued task was replaced by a newer one before it started
    #[error("task superseded by a newer submission")]
    Superseded,

    /// The task queue shut down before the task could report back
    #[error("task queue closed")]
    QueueClosed,

    /// A remote change-set could not be decoded or applied
    #[error("corrupt change-set: {0}")]
    CorruptChange(String),

    /// A remote checkpoint could not be loaded
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// CRDT document operation failed
    #[error("crdt error: {0}")]
    Crdt(String),

    /// Application state failed to (de)serialize against the document
    #[error("state error: {0}")]
    State(String),

    /// Error from the ledger boundary, propagated unchanged
    #[error(transparent)]
    Ledger(#[from] accord_ledger::Error),

    /// Error from the gossip transport boundary
    #[error(transparent)]
    Transport(#[from] accord_transport::Error),
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a CRDT error
    pub fn crdt(err: impl std::fmt::Display) -> Self {
        Self::Crdt(err.to_string())
    }

    /// Create a state (de)serialization error
    pub fn state(err: impl std::fmt::Display) -> Self {
        Self::State(err.to_string())
    }

    /// True when this error means a peer simply has no data yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Ledger(e) if e.is_not_found())
    }
}
