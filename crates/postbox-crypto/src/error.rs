//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Authentication tag did not verify; the envelope was modified or the
    /// wrong content key was used.
    #[error("Integrity check failed: authentication tag mismatch")]
    Integrity,

    /// The envelope does not follow the expected byte layout.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Key material could not be parsed or is unusable.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Wrapping the content key for a recipient failed.
    #[error("Key wrapping failed: {0}")]
    Wrap(String),

    /// Unwrapping failed (wrong private key or corrupted wrapped key).
    #[error("Key unwrapping failed")]
    Unwrap,

    /// Signing an attestation failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Signature verification failed.
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Unknown or unsupported digest algorithm name.
    #[error("Invalid hash algorithm: {0}")]
    InvalidHashAlgorithm(String),

    /// Invalid key length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length.
        expected: usize,
        /// Actual key length.
        actual: usize,
    },

    /// Invalid nonce length.
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength {
        /// Expected nonce length.
        expected: usize,
        /// Actual nonce length.
        actual: usize,
    },

    /// Invalid hex string format.
    #[error("Invalid hex string: {0}")]
    InvalidHexFormat(String),

    /// Key generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// IO error while streaming.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
