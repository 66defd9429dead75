//! Error types for the ledger boundary.

use thiserror::Error;

/// Ledger error types
#[derive(Debug, Error)]
pub enum Error {
    /// No tip is anchored for the requested DID
    #[error("not found: {0}")]
    NotFound(crate::Did),

    /// The signing key on the handle is not an owner of the tree
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation needs a signing key the handle does not carry
    #[error("missing signing key: {0}")]
    MissingKey(String),

    /// A path or transaction was malformed
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a missing-key error
    pub fn missing_key(msg: impl Into<String>) -> Self {
        Self::MissingKey(msg.into())
    }

    /// Create an invalid-transaction error
    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Self::InvalidTransaction(msg.into())
    }

    /// True when this error means "the tree simply has no tip yet"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
