//! Error types for exchange operations.

use thiserror::Error;

use postbox_crypto::CryptoError;
use postbox_protocol::{ProtocolError, StatusCode};
use postbox_store::{MessageId, PostboxId, ReferenceId, StoreError};

use crate::config::ConfigError;

/// Errors that can occur during exchange operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The owner has no postbox.
    #[error("No postbox for owner {0}")]
    NoPostbox(String),

    /// Postbox not found.
    #[error("Postbox not found: {0}")]
    PostboxNotFound(PostboxId),

    /// Key not registered on the postbox.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Message not found.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Webreference does not exist or was revoked.
    #[error("Reference gone: {0}")]
    ReferenceGone(ReferenceId),

    /// Payload missing a length or larger than allowed.
    #[error("Payload too large: {size:?} bytes, limit {limit}")]
    PayloadTooLarge {
        /// Declared or observed size; `None` if no length was declared.
        size: Option<u64>,
        /// Configured limit.
        limit: u64,
    },

    /// Owner quota exhausted.
    #[error("Quota exceeded: {used} used + {requested} requested > {limit}")]
    QuotaExceeded {
        /// Bytes already charged.
        used: u64,
        /// Bytes requested.
        requested: u64,
        /// Quota limit.
        limit: u64,
    },

    /// Remote source failed (network, TLS, status or timeout).
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// No free blob slot.
    #[error("No free blob slot")]
    NoFreeSlot,

    /// A recipient already received the message.
    #[error("Message {0} was already received and can no longer change")]
    ImmutableAfterReceipt(MessageId),

    /// Wrapping failed for some recipients and partial key lists are not
    /// accepted.
    #[error("Key wrapping failed for {failed} recipients")]
    PartialKeyList {
        /// Number of recipients that failed.
        failed: usize,
    },

    /// The caller is not allowed to perform the operation.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// The private key has no entry in the key list.
    #[error("Not a recipient of this content")]
    NotARecipient,

    /// Operation not supported for this kind of reference.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Cryptographic error.
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Store(StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::QuotaExceeded {
                used,
                requested,
                limit,
            } => Self::QuotaExceeded {
                used,
                requested,
                limit,
            },
            StoreError::NoFreeSlot { .. } => Self::NoFreeSlot,
            StoreError::Protocol(e) => Self::Protocol(e),
            other => Self::Store(other),
        }
    }
}

fn crypto_status(error: &CryptoError) -> StatusCode {
    match error {
        CryptoError::InvalidKey(_)
        | CryptoError::InvalidHashAlgorithm(_)
        | CryptoError::InvalidHexFormat(_)
        | CryptoError::MalformedEnvelope(_)
        | CryptoError::Integrity
        | CryptoError::Unwrap
        | CryptoError::SignatureVerification => StatusCode::BadRequest,
        _ => StatusCode::InternalError,
    }
}

impl CoreError {
    /// Status code to report to a transport.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoPostbox(_)
            | Self::PostboxNotFound(_)
            | Self::KeyNotFound(_)
            | Self::MessageNotFound(_) => StatusCode::NotFound,
            Self::ReferenceGone(_) => StatusCode::Gone,
            Self::PayloadTooLarge { .. } | Self::QuotaExceeded { .. } => {
                StatusCode::PayloadTooLarge
            }
            Self::RemoteUnavailable(_) => StatusCode::BadGateway,
            Self::ImmutableAfterReceipt(_) => StatusCode::Conflict,
            Self::PartialKeyList { .. } => StatusCode::UnprocessableEntity,
            Self::NotAuthorized(_) | Self::NotARecipient => StatusCode::Forbidden,
            Self::Unsupported(_) => StatusCode::NotImplemented,
            Self::InvalidRequest(_) => StatusCode::BadRequest,
            Self::Crypto(e) => crypto_status(e),
            Self::Protocol(e) => match e {
                ProtocolError::KeyListMismatch { .. } | ProtocolError::EmptyKeyList => {
                    StatusCode::UnprocessableEntity
                }
                ProtocolError::UnknownRecipient(_) => StatusCode::NotFound,
                ProtocolError::InvalidKeyList(_) | ProtocolError::InvalidReferenceType(_) => {
                    StatusCode::BadRequest
                }
                ProtocolError::Crypto(e) => crypto_status(e),
                ProtocolError::Serialization(_) => StatusCode::InternalError,
            },
            Self::Store(StoreError::NotFound(_)) => StatusCode::NotFound,
            Self::Store(StoreError::AlreadyExists(_)) => StatusCode::Conflict,
            Self::Store(StoreError::InvalidPath(_)) => StatusCode::BadRequest,
            Self::Configuration(_) | Self::NoFreeSlot | Self::Store(_) | Self::Io(_) => {
                StatusCode::InternalError
            }
        }
    }
}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CoreError::PayloadTooLarge {
                size: None,
                limit: 1
            }
            .status()
            .code(),
            413
        );
        assert_eq!(
            CoreError::from(StoreError::QuotaExceeded {
                used: 1,
                requested: 2,
                limit: 2
            })
            .status()
            .code(),
            413
        );
        assert_eq!(CoreError::RemoteUnavailable("x".into()).status().code(), 502);
        assert_eq!(CoreError::ReferenceGone(1).status().code(), 410);
        assert_eq!(CoreError::MessageNotFound(1).status().code(), 404);
        assert_eq!(CoreError::NoPostbox("a".into()).status().code(), 404);
        assert_eq!(CoreError::ImmutableAfterReceipt(1).status().code(), 409);
        assert_eq!(CoreError::Unsupported("c".into()).status().code(), 501);
        assert_eq!(
            CoreError::from(ProtocolError::KeyListMismatch {
                expected: 2,
                actual: 1
            })
            .status()
            .code(),
            422
        );
        assert_eq!(
            CoreError::from(CryptoError::InvalidKey("k".into()))
                .status()
                .code(),
            400
        );
    }

    #[test]
    fn test_store_errors_lifted() {
        assert!(matches!(
            CoreError::from(StoreError::NoFreeSlot { attempts: 100 }),
            CoreError::NoFreeSlot
        ));
        assert!(matches!(
            CoreError::from(StoreError::Protocol(ProtocolError::EmptyKeyList)),
            CoreError::Protocol(ProtocolError::EmptyKeyList)
        ));
    }
}
