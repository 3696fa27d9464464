//! Error types for engram-core.

use thiserror::Error;

/// Result type alias using engram-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected write of blank content
    #[error("Memory content is empty")]
    EmptyContent,

    /// No record exists for the given id
    #[error("Memory {0} not found")]
    NotFound(String),

    /// Promotion source is not in the short-term tier
    #[error("Memory {0} is not short-term and cannot be promoted")]
    NotStm(String),

    /// Promotion source already carries a promotion linkage
    #[error("Memory {0} was already promoted")]
    AlreadyPromoted(String),

    /// Embedding collaborator failed; storage and lexical search degrade
    #[error("Embedding unavailable: {0}")]
    Embedding(String),

    /// Backing store unavailable or a statement failed
    #[error("Memory storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error from any id-like value.
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(id.to_string())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
