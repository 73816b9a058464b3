//! Error types for protocol operations.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] postbox_crypto::CryptoError),

    /// The key list does not decode or contains invalid fingerprints.
    #[error("Invalid key list: {0}")]
    InvalidKeyList(String),

    /// The key list has no entries.
    #[error("Key list is empty")]
    EmptyKeyList,

    /// Key list entries do not match the verifying postbox keys.
    #[error("Key list mismatch: {expected} entries, {actual} verified keys")]
    KeyListMismatch {
        /// Number of entries in the key list.
        expected: usize,
        /// Number of postbox keys that matched and verified.
        actual: usize,
    },

    /// A receipt was marked for a keyhash that is not tracked.
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Unknown webreference type.
    #[error("Invalid reference type: {0}")]
    InvalidReferenceType(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
