//! Stored record types.
//!
//! Records are serialized with bincode. Blob references hold only the slot
//! token; the owner and area are implied by the record.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use postbox_crypto::HashAlgorithm;
use postbox_protocol::{KeyList, ReceiptState, ReferenceType};

/// Identifier of a postbox.
pub type PostboxId = u64;

/// Identifier of a webreference.
pub type ReferenceId = u64;

/// Identifier of a stored message.
pub type MessageId = u64;

/// A recipient endpoint owned by one content owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostboxRecord {
    /// Unique postbox identifier.
    pub id: PostboxId,
    /// Content owner; quota is charged to this id.
    pub owner: String,
    /// Only senders holding a persistent token may push references.
    pub only_persistent: bool,
    /// Delivered content may be re-encrypted for the owner's other clients.
    pub shared: bool,
    /// Digest for fingerprints, attestation and signatures.
    pub hash_algorithm: HashAlgorithm,
    /// Current attestation (URL-safe base64); `None` while there are no keys.
    pub attestation: Option<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of the last change.
    pub updated_at: i64,
}

impl PostboxRecord {
    /// Create a new record; the id is assigned on insert.
    pub fn new(owner: impl Into<String>, hash_algorithm: HashAlgorithm) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: 0,
            owner: owner.into(),
            only_persistent: false,
            shared: true,
            hash_algorithm,
            attestation: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A public key registered on a postbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Owning postbox.
    pub postbox_id: PostboxId,
    /// Hex digest of the canonical SPKI PEM; key list entry name.
    pub pubkeyhash: String,
    /// Hex digest of the key bytes as registered.
    pub hash: String,
    /// Key bytes as registered.
    pub key: Vec<u8>,
    /// Signature over the postbox attestation.
    pub signature: Option<String>,
    /// Unix timestamp of registration.
    pub added_at: i64,
}

/// A webreference pushed to a postbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Unique reference identifier.
    pub id: ReferenceId,
    /// Owning postbox.
    pub postbox_id: PostboxId,
    /// Owner of the postbox, charged for the cached content.
    pub owner: String,
    /// Remote location of the encrypted content.
    pub url: String,
    /// How the reference is served.
    pub rtype: ReferenceType,
    /// Wrapped content keys per recipient.
    pub key_list: KeyList,
    /// Digest used by the sender.
    pub hash_algorithm: HashAlgorithm,
    /// Blob token of the cached content.
    pub cached_content: Option<String>,
    /// Size of the cached content; `None` until fetched.
    pub cached_size: Option<u64>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl ReferenceRecord {
    /// Whether the content has been fetched and cached.
    pub fn is_cached(&self) -> bool {
        self.cached_size.is_some() && self.cached_content.is_some()
    }
}

/// An encrypted message stored on the sender's side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message identifier.
    pub id: MessageId,
    /// Owning postbox.
    pub postbox_id: PostboxId,
    /// Owner of the postbox, charged for the envelope.
    pub owner: String,
    /// Blob token of the envelope.
    pub encrypted_content: Option<String>,
    /// Envelope size in bytes.
    pub content_size: u64,
    /// Wrapped content keys per recipient.
    pub key_list: KeyList,
    /// Fingerprint of the sender's own key, if it is in the key list.
    pub own_hash: Option<String>,
    /// Digest used for wrapping.
    pub hash_algorithm: HashAlgorithm,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of the last update.
    pub updated_at: i64,
}

/// Receipt state of one receiver token of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverToken {
    /// Message the token belongs to.
    pub message_id: MessageId,
    /// Random URL-safe token.
    pub token: String,
    /// Whether the token holder confirmed retrieval.
    pub state: ReceiptState,
}

/// Target of a delivery tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackerTarget {
    /// A stored message.
    Message(MessageId),
    /// A webreference.
    Reference(ReferenceId),
}

impl TrackerTarget {
    /// Key of the tracker row.
    pub fn to_key(&self) -> [u8; 9] {
        let (tag, id) = match self {
            Self::Message(id) => (b'm', *id),
            Self::Reference(id) => (b'r', *id),
        };
        let mut key = [0u8; 9];
        key[0] = tag;
        key[1..].copy_from_slice(&id.to_be_bytes());
        key
    }
}

impl std::fmt::Display for TrackerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(id) => write!(f, "message:{}", id),
            Self::Reference(id) => write!(f, "reference:{}", id),
        }
    }
}
