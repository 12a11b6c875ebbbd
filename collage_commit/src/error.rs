//! Error types for collage_commit.

use thiserror::Error;

/// Result type for collage_commit operations.
pub type Result<T> = std::result::Result<T, CommitError>;

/// Errors that can occur while driving a collage commit.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Transaction failed.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// State transition not valid.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// Transport channel closed.
    #[error("transport channel closed")]
    ChannelClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for CommitError {
    fn from(err: bincode::Error) -> Self {
        CommitError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CommitError {
    fn from(err: std::io::Error) -> Self {
        CommitError::Storage(err.to_string())
    }
}
