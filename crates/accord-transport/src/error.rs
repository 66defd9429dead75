//! Error types for the transport boundary.

use thiserror::Error;

/// Transport error types
#[derive(Debug, Error)]
pub enum Error {
    /// Publishing to a topic failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscribing to a topic failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a subscribe error
    pub fn subscribe(msg: impl Into<String>) -> Self {
        Self::Subscribe(msg.into())
    }
}
