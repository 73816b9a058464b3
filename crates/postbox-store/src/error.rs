//! Error types for storage operations.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] postbox_protocol::ProtocolError),

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Corruption detected.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Charging the owner would exceed the storage quota.
    #[error("Quota exceeded: {used} used + {requested} requested > {limit}")]
    QuotaExceeded {
        /// Bytes already charged to the owner.
        used: u64,
        /// Bytes requested.
        requested: u64,
        /// Quota limit.
        limit: u64,
    },

    /// No free blob slot was found.
    #[error("No free blob slot after {attempts} attempts")]
    NoFreeSlot {
        /// Attempts made.
        attempts: usize,
    },

    /// A path component (owner or token) is not usable on the filesystem.
    #[error("Invalid path component: {0}")]
    InvalidPath(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) fn db_err(context: &'static str) -> impl FnOnce(sled::Error) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}
