//! Message exchange: postboxes, messages, webreferences and receipts.
//!
//! [`MessageExchange`] ties the codec, key wrapping, attestation and
//! delivery tracking to the row store, the blob store and a remote source.
//! All state lives in those stores; the exchange itself only holds the
//! per-id guards that serialise fetches, updates and receipts.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use postbox_crypto::{encode, ContentKey, EnvelopeHeader, HashAlgorithm, RecipientPublicKey};
use postbox_protocol::limits::KEYLIST_HEADER;
use postbox_protocol::{
    verify_key_list, Attestation, AttestedKey, DeliveryTracker, KeyList, ProtocolError,
    ReferenceType,
};
use postbox_store::{
    random_token, BlobArea, BlobStore, KeyRecord, MessageId, MessageRecord, PostboxDb, PostboxId,
    PostboxRecord, ReferenceId, ReferenceRecord, Spool, StoreError, TrackerTarget,
};

use crate::cache::{CachedContent, ContentCache};
use crate::config::ExchangeConfig;
use crate::fetch::{HttpSource, RemoteSource, RequestContext};
use crate::guard::GuardRegistry;
use crate::{CoreError, Result};

const DB_DIR: &str = "db";
const BLOB_DIR: &str = "blobs";

/// Options for a new postbox.
#[derive(Clone, Debug)]
pub struct PostboxOptions {
    /// Only senders holding a persistent token may push references.
    pub only_persistent: bool,
    /// Delivered content may be re-encrypted and updated.
    pub shared: bool,
    /// Digest algorithm; the configured default if `None`.
    pub hash_algorithm: Option<HashAlgorithm>,
}

impl Default for PostboxOptions {
    fn default() -> Self {
        Self {
            only_persistent: false,
            shared: true,
            hash_algorithm: None,
        }
    }
}

/// A registered key as reported by [`MessageExchange::postbox_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    /// Fingerprint of the canonical key encoding.
    pub pubkeyhash: String,
    /// Fingerprint of the key bytes as registered.
    pub hash: String,
    /// Stored signature, if any.
    pub signature: Option<String>,
    /// Whether the signature verifies against the current attestation.
    pub signature_valid: bool,
}

/// Public view of a postbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostboxInfo {
    /// Postbox id.
    pub id: PostboxId,
    /// Content owner.
    pub owner: String,
    /// Digest algorithm.
    pub hash_algorithm: HashAlgorithm,
    /// Current attestation, `None` while no keys are registered.
    pub attestation: Option<String>,
    /// Whether only persistent senders may push.
    pub only_persistent: bool,
    /// Whether content may be updated.
    pub shared: bool,
    /// Registered keys in fingerprint order.
    pub keys: Vec<KeyInfo>,
}

/// Options for sending a message.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Digest for wrapping and fingerprints; the configured default if `None`.
    pub hash_algorithm: Option<HashAlgorithm>,
    /// Sender's own fingerprint; tracked as received from the start.
    pub own_hash: Option<String>,
    /// Receiver tokens to issue; the configured default if `None`.
    pub amount_tokens: Option<usize>,
    /// Envelope header.
    pub header: EnvelopeHeader,
}

/// A recipient whose key could not be used.
#[derive(Debug)]
pub struct RecipientFailure {
    /// Position in the recipient list.
    pub index: usize,
    /// Why the recipient was skipped.
    pub error: CoreError,
}

/// Outcome of a send or content update.
#[derive(Debug)]
pub struct SendReport {
    /// Stored message.
    pub message_id: MessageId,
    /// Wrapped content keys of the recipients that succeeded.
    pub key_list: KeyList,
    /// Recipients that were skipped.
    pub failures: Vec<RecipientFailure>,
    /// Receiver tokens issued; empty for updates.
    pub tokens: Vec<String>,
    /// Envelope size in bytes.
    pub size: u64,
}

impl SendReport {
    /// Whether every recipient got a key list entry.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Change to an existing message.
#[derive(Clone, Debug)]
pub enum MessageUpdate {
    /// Re-encrypt new content under a fresh key for the given recipients.
    Content {
        /// New plaintext.
        plaintext: Vec<u8>,
        /// Recipient public keys (PEM or DER).
        recipients: Vec<Vec<u8>>,
        /// Envelope header.
        header: EnvelopeHeader,
    },
    /// Replace the key list of the current content.
    KeyList(KeyList),
}

/// A webreference pushed by a sender.
#[derive(Clone, Debug)]
pub struct NewReference {
    /// Remote location of the envelope.
    pub url: String,
    /// How the reference is served.
    pub rtype: ReferenceType,
    /// Wrapped content keys per recipient.
    pub key_list: KeyList,
    /// Name of the digest used by the sender.
    pub hash_algorithm: String,
    /// Whether the sender holds a persistent token.
    pub persistent_sender: bool,
}

/// Result of accessing a webreference.
#[derive(Debug)]
pub enum ReferenceAccess {
    /// Envelope content served from the cache.
    Content(CachedContent),
    /// The client should fetch the content itself.
    Redirect {
        /// Remote location.
        url: String,
        /// Wrapped content keys.
        key_list: KeyList,
    },
}

/// A stored message ready to be served.
#[derive(Debug)]
pub struct MessageView {
    /// Message row.
    pub message: MessageRecord,
    /// Envelope bytes.
    pub body: File,
    /// Envelope size in bytes.
    pub size: u64,
    /// Whether every requested keyhash has received.
    pub all_received: bool,
}

impl MessageView {
    /// `X-KEYLIST` response metadata.
    pub fn keylist_header(&self) -> Result<(&'static str, String)> {
        Ok((KEYLIST_HEADER, self.message.key_list.to_json()?))
    }
}

struct Sealed {
    spool: Spool,
    key_list: KeyList,
    failures: Vec<RecipientFailure>,
}

/// The message exchange.
pub struct MessageExchange {
    config: ExchangeConfig,
    db: PostboxDb,
    blobs: BlobStore,
    cache: ContentCache,
    message_guards: GuardRegistry<MessageId>,
    _temp_dir: Option<TempDir>,
}

impl MessageExchange {
    /// Open an exchange that fetches webreferences over HTTP.
    pub fn new(config: ExchangeConfig) -> Result<Self> {
        let source = HttpSource::new(config.fetch.timeout)?;
        Self::with_source(config, Arc::new(source))
    }

    /// Open an exchange with a custom remote source.
    ///
    /// With `storage.in_memory` the row store is temporary and blobs live in
    /// a temporary directory removed when the exchange is dropped.
    pub fn with_source(config: ExchangeConfig, source: Arc<dyn RemoteSource>) -> Result<Self> {
        config.validate()?;

        let (db, blobs, temp_dir) = if config.storage.in_memory {
            let dir = TempDir::new()?;
            let blobs = BlobStore::open(dir.path())?;
            (PostboxDb::temporary()?, blobs, Some(dir))
        } else {
            let data_dir = &config.storage.data_dir;
            let db = PostboxDb::open(&data_dir.join(DB_DIR))?;
            let blobs = BlobStore::open(data_dir.join(BLOB_DIR))?;
            (db, blobs, None)
        };

        let cache = ContentCache::new(
            db.clone(),
            blobs.clone(),
            source,
            config.limits.clone(),
            config.fetch.clone(),
        );
        info!(in_memory = config.storage.in_memory, "message exchange opened");

        Ok(Self {
            config,
            db,
            blobs,
            cache,
            message_guards: GuardRegistry::new(),
            _temp_dir: temp_dir,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Row store.
    pub fn db(&self) -> &PostboxDb {
        &self.db
    }

    /// Blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Content cache.
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Flush the row store to disk.
    pub fn flush(&self) -> Result<()> {
        Ok(self.db.flush()?)
    }

    // =======================================================================
    // Postboxes
    // =======================================================================

    /// Create the postbox of an owner.
    ///
    /// # Errors
    ///
    /// Returns `Store(AlreadyExists)` if the owner already has one.
    pub fn create_postbox(&self, owner: &str, options: PostboxOptions) -> Result<PostboxRecord> {
        let algorithm = options
            .hash_algorithm
            .unwrap_or(self.config.crypto.hash_algorithm);
        let mut record = PostboxRecord::new(owner, algorithm);
        record.only_persistent = options.only_persistent;
        record.shared = options.shared;
        let record = self.db.insert_postbox(record)?;
        info!(postbox = record.id, owner, algorithm = algorithm.name(), "postbox created");
        Ok(record)
    }

    /// Register a public key (PEM or DER) on a postbox.
    ///
    /// Registering a key that is already present returns the stored record.
    pub fn add_key(&self, postbox_id: PostboxId, raw_key: &[u8]) -> Result<KeyRecord> {
        let postbox = self.postbox(postbox_id)?;
        let public_key = RecipientPublicKey::parse(raw_key)?;
        let pubkeyhash = public_key.fingerprint(postbox.hash_algorithm)?;

        if let Some(existing) = self.db.get_key(postbox_id, &pubkeyhash)? {
            debug!(postbox = postbox_id, %pubkeyhash, "key already registered");
            return Ok(existing);
        }

        let record = KeyRecord {
            postbox_id,
            hash: public_key.content_hash(postbox.hash_algorithm),
            pubkeyhash,
            key: raw_key.to_vec(),
            signature: None,
            added_at: Utc::now().timestamp(),
        };
        self.db.put_key(&record)?;
        info!(postbox = postbox_id, pubkeyhash = %record.pubkeyhash, "key added");
        self.on_keyset_changed(postbox_id)?;
        Ok(record)
    }

    /// Remove a key from a postbox.
    pub fn remove_key(&self, postbox_id: PostboxId, pubkeyhash: &str) -> Result<KeyRecord> {
        self.postbox(postbox_id)?;
        let removed = self
            .db
            .remove_key(postbox_id, pubkeyhash)?
            .ok_or_else(|| CoreError::KeyNotFound(pubkeyhash.to_string()))?;
        info!(postbox = postbox_id, pubkeyhash, "key removed");
        self.on_keyset_changed(postbox_id)?;
        Ok(removed)
    }

    /// Set or clear the signature of a key over the current attestation.
    ///
    /// # Errors
    ///
    /// Returns `Crypto(SignatureVerification)` if the signature does not
    /// verify against the current attestation.
    pub fn set_signature(
        &self,
        postbox_id: PostboxId,
        pubkeyhash: &str,
        signature: Option<&str>,
    ) -> Result<()> {
        let postbox = self.postbox(postbox_id)?;
        let mut record = self
            .db
            .get_key(postbox_id, pubkeyhash)?
            .ok_or_else(|| CoreError::KeyNotFound(pubkeyhash.to_string()))?;

        if let Some(signature) = signature {
            let attestation = current_attestation(&postbox)?
                .ok_or_else(|| CoreError::KeyNotFound(pubkeyhash.to_string()))?;
            RecipientPublicKey::parse(&record.key)?.verify_attestation(
                attestation.as_bytes(),
                signature,
                postbox.hash_algorithm,
            )?;
        }

        record.signature = signature.map(str::to_string);
        self.db.put_key(&record)?;
        info!(
            postbox = postbox_id,
            pubkeyhash,
            signed = record.signature.is_some(),
            "key signature changed"
        );
        self.on_keyset_changed(postbox_id)?;
        Ok(())
    }

    /// Attestation, keys and signatures of a postbox.
    pub fn postbox_info(&self, postbox_id: PostboxId) -> Result<PostboxInfo> {
        let postbox = self.postbox(postbox_id)?;
        let attestation = current_attestation(&postbox)?;
        let mut keys = Vec::new();
        for record in self.db.keys_for_postbox(postbox_id)? {
            let signature_valid = match (&attestation, &record.signature) {
                (Some(attestation), Some(signature)) => RecipientPublicKey::parse(&record.key)
                    .and_then(|key| {
                        key.verify_attestation(attestation.as_bytes(), signature, postbox.hash_algorithm)
                    })
                    .is_ok(),
                _ => false,
            };
            keys.push(KeyInfo {
                pubkeyhash: record.pubkeyhash,
                hash: record.hash,
                signature: record.signature,
                signature_valid,
            });
        }
        Ok(PostboxInfo {
            id: postbox.id,
            owner: postbox.owner,
            hash_algorithm: postbox.hash_algorithm,
            attestation: postbox.attestation,
            only_persistent: postbox.only_persistent,
            shared: postbox.shared,
            keys,
        })
    }

    /// Recompute and store the attestation of a postbox.
    ///
    /// Called after every key set or signature change.
    pub fn on_keyset_changed(&self, postbox_id: PostboxId) -> Result<Option<Attestation>> {
        let mut postbox = self.postbox(postbox_id)?;
        let keys = self.db.keys_for_postbox(postbox_id)?;
        let attestation = if keys.is_empty() {
            None
        } else {
            Some(Attestation::compute(
                postbox.hash_algorithm,
                keys.iter().map(|k| k.pubkeyhash.as_str()),
            )?)
        };
        postbox.attestation = attestation.as_ref().map(Attestation::to_b64);
        postbox.updated_at = Utc::now().timestamp();
        self.db.update_postbox(&postbox)?;
        debug!(
            postbox = postbox_id,
            keys = keys.len(),
            attestation = postbox.attestation.as_deref().unwrap_or("-"),
            "attestation recomputed"
        );
        Ok(attestation)
    }

    /// Delete a postbox with everything it owns.
    ///
    /// Blobs are removed and their quota refunded.
    pub async fn delete_postbox(&self, postbox_id: PostboxId) -> Result<()> {
        self.postbox(postbox_id)?;

        let mut guards: Vec<OwnedMutexGuard<()>> = Vec::new();
        for reference in self.db.references_for_postbox(postbox_id)? {
            guards.push(self.cache.lock(reference.id).await);
        }
        for message in self.db.messages_for_postbox(postbox_id)? {
            guards.push(self.message_guards.lock(message.id).await);
        }

        let report = self.db.delete_postbox(postbox_id)?;
        for reference in &report.references {
            self.on_reference_deleted(reference)?;
        }
        for message in &report.messages {
            self.on_message_deleted(message)?;
        }
        info!(
            postbox = postbox_id,
            references = report.references.len(),
            messages = report.messages.len(),
            keys = report.keys,
            "postbox and contents deleted"
        );
        Ok(())
    }

    // =======================================================================
    // Sending
    // =======================================================================

    /// Encrypt and store a message for a set of recipients.
    ///
    /// Recipient keys that fail to parse or wrap are reported in the result
    /// and left out of the key list.
    ///
    /// # Errors
    ///
    /// - `NoPostbox` if the owner has no postbox
    /// - `Protocol(EmptyKeyList)` if no recipient could be used
    /// - `PartialKeyList` if some recipients failed and
    ///   `send.require_all_recipients` is set
    /// - `PayloadTooLarge` or `QuotaExceeded` for oversized envelopes
    pub fn send<P, K>(
        &self,
        owner: &str,
        plaintext: P,
        recipients: &[K],
        options: SendOptions,
    ) -> Result<SendReport>
    where
        P: Read,
        K: AsRef<[u8]>,
    {
        let postbox = self
            .db
            .postbox_for_owner(owner)?
            .ok_or_else(|| CoreError::NoPostbox(owner.to_string()))?;
        let algorithm = options
            .hash_algorithm
            .unwrap_or(self.config.crypto.hash_algorithm);
        let amount_tokens = options
            .amount_tokens
            .unwrap_or(self.config.send.default_amount_tokens);
        if amount_tokens > postbox_protocol::limits::MAX_AMOUNT_TOKENS {
            return Err(CoreError::InvalidRequest(format!(
                "at most {} receiver tokens",
                postbox_protocol::limits::MAX_AMOUNT_TOKENS
            )));
        }

        let sealed = self.seal(plaintext, recipients, algorithm, &options.header)?;
        let own_hash = options
            .own_hash
            .filter(|hash| sealed.key_list.contains(hash));
        let (token, size) = self.store_envelope(sealed.spool, &postbox.owner)?;

        let now = Utc::now().timestamp();
        let record = MessageRecord {
            id: 0,
            postbox_id: postbox.id,
            owner: postbox.owner.clone(),
            encrypted_content: Some(token.clone()),
            content_size: size,
            key_list: sealed.key_list,
            own_hash,
            hash_algorithm: algorithm,
            created_at: now,
            updated_at: now,
        };
        let record = match self.db.insert_message(record) {
            Ok(record) => record,
            Err(e) => {
                self.discard_envelope(&postbox.owner, &token, size)?;
                return Err(e.into());
            }
        };

        let tracker = DeliveryTracker::new(record.key_list.fingerprints(), record.own_hash.as_deref());
        self.db.put_tracker(TrackerTarget::Message(record.id), &tracker)?;
        let tokens: Vec<String> = (0..amount_tokens).map(|_| random_token()).collect();
        self.db.add_receiver_tokens(record.id, &tokens)?;

        info!(
            message = record.id,
            postbox = postbox.id,
            recipients = record.key_list.len(),
            failed = sealed.failures.len(),
            size,
            "message stored"
        );
        Ok(SendReport {
            message_id: record.id,
            key_list: record.key_list,
            failures: sealed.failures,
            tokens,
            size,
        })
    }

    /// Change the content or key list of a message nobody has received yet.
    ///
    /// # Errors
    ///
    /// - `ImmutableAfterReceipt` once any recipient other than the sender
    ///   or any receiver token has received
    /// - `NotAuthorized` if the postbox is not shared
    pub async fn update(&self, message_id: MessageId, change: MessageUpdate) -> Result<SendReport> {
        let _guard = self.message_guards.lock(message_id).await;

        let mut message = self.message(message_id)?;
        let postbox = self.postbox(message.postbox_id)?;
        if !postbox.shared {
            return Err(CoreError::NotAuthorized(format!(
                "postbox {} does not allow updates",
                postbox.id
            )));
        }
        self.ensure_unreceived(&message)?;

        let failures = match change {
            MessageUpdate::KeyList(key_list) => {
                if key_list.is_empty() {
                    return Err(ProtocolError::EmptyKeyList.into());
                }
                message.key_list = key_list;
                message.own_hash = message.own_hash.filter(|h| message.key_list.contains(h));
                message.updated_at = Utc::now().timestamp();
                self.db.update_message(&message)?;
                Vec::new()
            }
            MessageUpdate::Content {
                plaintext,
                recipients,
                header,
            } => {
                let sealed =
                    self.seal(plaintext.as_slice(), &recipients, message.hash_algorithm, &header)?;
                // The replaced envelope's bytes do not count against the new one.
                let previous = message.clone();
                let previous_size = previous
                    .encrypted_content
                    .as_ref()
                    .map_or(0, |_| previous.content_size);
                self.db.release_quota(&message.owner, previous_size)?;
                let (token, size) = match self.store_envelope(sealed.spool, &message.owner) {
                    Ok(stored) => stored,
                    Err(e) => {
                        self.db.charge_quota(&message.owner, previous_size, u64::MAX)?;
                        return Err(e);
                    }
                };

                message.encrypted_content = Some(token.clone());
                message.content_size = size;
                message.key_list = sealed.key_list;
                message.own_hash = message.own_hash.filter(|h| message.key_list.contains(h));
                message.updated_at = Utc::now().timestamp();
                if let Err(e) = self.db.update_message(&message) {
                    self.discard_envelope(&message.owner, &token, size)?;
                    self.db.charge_quota(&message.owner, previous_size, u64::MAX)?;
                    return Err(e.into());
                }
                if let Some(old) = &previous.encrypted_content {
                    let removed = self.blobs.remove(BlobArea::Sending, &previous.owner, old)?;
                    debug!(message = message_id, removed, "replaced envelope removed");
                }
                sealed.failures
            }
        };

        let tracker = DeliveryTracker::new(message.key_list.fingerprints(), message.own_hash.as_deref());
        self.db.put_tracker(TrackerTarget::Message(message_id), &tracker)?;
        info!(
            message = message_id,
            recipients = message.key_list.len(),
            size = message.content_size,
            "message updated"
        );
        Ok(SendReport {
            message_id,
            key_list: message.key_list,
            failures,
            tokens: Vec::new(),
            size: message.content_size,
        })
    }

    // =======================================================================
    // Webreferences
    // =======================================================================

    /// Register a webreference on a postbox.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidHashAlgorithm)` for an unknown digest name
    /// - `NotAuthorized` if the postbox only accepts persistent senders
    /// - `Protocol(EmptyKeyList | KeyListMismatch)` if the key list does not
    ///   match the signed postbox keys
    pub fn push_reference(&self, postbox_id: PostboxId, new: NewReference) -> Result<ReferenceRecord> {
        let postbox = self.postbox(postbox_id)?;
        let hash_algorithm: HashAlgorithm = new.hash_algorithm.parse()?;
        if postbox.only_persistent && !new.persistent_sender {
            return Err(CoreError::NotAuthorized(format!(
                "postbox {} only accepts persistent senders",
                postbox_id
            )));
        }

        let attestation = current_attestation(&postbox)?;
        let verified = match attestation {
            Some(attestation) => verify_key_list(
                &new.key_list,
                &self.attested_keys(postbox_id)?,
                &attestation,
                postbox.hash_algorithm,
            )?,
            None if new.key_list.is_empty() => return Err(ProtocolError::EmptyKeyList.into()),
            None => {
                return Err(ProtocolError::KeyListMismatch {
                    expected: new.key_list.len(),
                    actual: 0,
                }
                .into())
            }
        };

        let record = self.db.insert_reference(ReferenceRecord {
            id: 0,
            postbox_id,
            owner: postbox.owner.clone(),
            url: new.url,
            rtype: new.rtype,
            key_list: new.key_list,
            hash_algorithm,
            cached_content: None,
            cached_size: None,
            created_at: Utc::now().timestamp(),
        })?;
        let tracker = DeliveryTracker::new(record.key_list.fingerprints(), None);
        self.db.put_tracker(TrackerTarget::Reference(record.id), &tracker)?;
        info!(
            reference = record.id,
            postbox = postbox_id,
            rtype = record.rtype.name(),
            verified,
            "webreference registered"
        );
        Ok(record)
    }

    /// Fetch a message reference through the cache.
    pub async fn fetch(&self, reference_id: ReferenceId, context: &RequestContext) -> Result<CachedContent> {
        self.cache.fetch_or_get_cached(reference_id, context).await
    }

    /// Serve a webreference according to its type.
    ///
    /// # Errors
    ///
    /// - `ReferenceGone` if the reference does not exist
    /// - `Unsupported` for content references
    pub async fn access_reference(
        &self,
        reference_id: ReferenceId,
        context: &RequestContext,
    ) -> Result<ReferenceAccess> {
        let reference = self
            .db
            .get_reference(reference_id)?
            .ok_or(CoreError::ReferenceGone(reference_id))?;
        match reference.rtype {
            ReferenceType::Message => Ok(ReferenceAccess::Content(
                self.fetch(reference_id, context).await?,
            )),
            ReferenceType::Redirect => Ok(ReferenceAccess::Redirect {
                url: reference.url,
                key_list: reference.key_list,
            }),
            ReferenceType::Content => Err(CoreError::Unsupported(format!(
                "{} references",
                reference.rtype.name()
            ))),
        }
    }

    /// Revoke a webreference, dropping its cached content.
    pub async fn revoke_reference(&self, reference_id: ReferenceId) -> Result<ReferenceRecord> {
        let _guard = self.cache.lock(reference_id).await;
        let record = self
            .db
            .delete_reference(reference_id)?
            .ok_or(CoreError::ReferenceGone(reference_id))?;
        self.on_reference_deleted(&record)?;
        info!(reference = reference_id, "webreference revoked");
        Ok(record)
    }

    /// Release the cached blob and quota of a deleted reference.
    pub fn on_reference_deleted(&self, record: &ReferenceRecord) -> Result<()> {
        if let (Some(token), Some(size)) = (&record.cached_content, record.cached_size) {
            let removed = self.blobs.remove(BlobArea::Cached, &record.owner, token)?;
            self.db.release_quota(&record.owner, size)?;
            debug!(reference = record.id, size, removed, "cached content released");
        }
        Ok(())
    }

    // =======================================================================
    // Messages
    // =======================================================================

    /// Open a stored message for serving.
    ///
    /// `all_received` reports whether every keyhash in `keyhashes` has
    /// received the message; it is `false` for an empty set.
    pub fn view_message<S: AsRef<str>>(&self, message_id: MessageId, keyhashes: &[S]) -> Result<MessageView> {
        let message = self.message(message_id)?;
        let token = message
            .encrypted_content
            .as_deref()
            .ok_or(CoreError::MessageNotFound(message_id))?;
        let body = self
            .blobs
            .open_blob(BlobArea::Sending, &message.owner, token)
            .map_err(|e| match e {
                StoreError::NotFound(_) => CoreError::MessageNotFound(message_id),
                other => other.into(),
            })?;
        let all_received = self
            .db
            .get_tracker(TrackerTarget::Message(message_id))?
            .is_some_and(|tracker| tracker.all_received(keyhashes));
        Ok(MessageView {
            size: message.content_size,
            message,
            body,
            all_received,
        })
    }

    /// Delete a message and its envelope.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<MessageRecord> {
        let _guard = self.message_guards.lock(message_id).await;
        let record = self
            .db
            .delete_message(message_id)?
            .ok_or(CoreError::MessageNotFound(message_id))?;
        self.on_message_deleted(&record)?;
        info!(message = message_id, "message deleted");
        Ok(record)
    }

    /// Release the envelope blob and quota of a deleted message.
    pub fn on_message_deleted(&self, record: &MessageRecord) -> Result<()> {
        if let Some(token) = &record.encrypted_content {
            let removed = self.blobs.remove(BlobArea::Sending, &record.owner, token)?;
            self.db.release_quota(&record.owner, record.content_size)?;
            debug!(message = record.id, size = record.content_size, removed, "envelope released");
        }
        Ok(())
    }

    // =======================================================================
    // Receipts
    // =======================================================================

    /// Record that a recipient received a message or webreference.
    ///
    /// Returns `true` if the state changed.
    ///
    /// # Errors
    ///
    /// Returns `Protocol(UnknownRecipient)` if the keyhash is not tracked.
    pub async fn mark_received(&self, target: TrackerTarget, keyhash: &str) -> Result<bool> {
        let _guard = match target {
            TrackerTarget::Message(id) => Some(self.message_guards.lock(id).await),
            TrackerTarget::Reference(_) => None,
        };
        let changed = self
            .db
            .update_tracker(target, |tracker| Ok(tracker.mark_received(keyhash)?))
            .map_err(|e| missing_target(e, target))?;
        if changed {
            info!(%target, keyhash, "received");
        }
        Ok(changed)
    }

    /// Record that the holder of a receiver token received a message.
    pub async fn mark_token_received(&self, message_id: MessageId, token: &str) -> Result<bool> {
        let _guard = self.message_guards.lock(message_id).await;
        let changed = self
            .db
            .mark_token_received(message_id, token)
            .map_err(|e| match e {
                StoreError::NotFound(_) => CoreError::NotAuthorized("unknown receiver token".into()),
                other => other.into(),
            })?;
        if changed {
            info!(message = message_id, "received via token");
        }
        Ok(changed)
    }

    /// Receipt states of a message or webreference.
    pub fn tracker(&self, target: TrackerTarget) -> Result<DeliveryTracker> {
        self.db
            .get_tracker(target)?
            .ok_or_else(|| missing_target(StoreError::NotFound(target.to_string()), target))
    }

    // =======================================================================
    // Helpers
    // =======================================================================

    fn postbox(&self, postbox_id: PostboxId) -> Result<PostboxRecord> {
        self.db
            .get_postbox(postbox_id)?
            .ok_or(CoreError::PostboxNotFound(postbox_id))
    }

    fn message(&self, message_id: MessageId) -> Result<MessageRecord> {
        self.db
            .get_message(message_id)?
            .ok_or(CoreError::MessageNotFound(message_id))
    }

    fn attested_keys(&self, postbox_id: PostboxId) -> Result<Vec<AttestedKey>> {
        let mut keys = Vec::new();
        for record in self.db.keys_for_postbox(postbox_id)? {
            match RecipientPublicKey::parse(&record.key) {
                Ok(public_key) => keys.push(AttestedKey {
                    pubkeyhash: record.pubkeyhash,
                    public_key,
                    signature: record.signature,
                }),
                Err(e) => warn!(postbox = postbox_id, pubkeyhash = %record.pubkeyhash, error = %e, "unusable stored key"),
            }
        }
        Ok(keys)
    }

    fn ensure_unreceived(&self, message: &MessageRecord) -> Result<()> {
        let retrieved = self
            .db
            .get_tracker(TrackerTarget::Message(message.id))?
            .is_some_and(|tracker| tracker.was_retrieved());
        let token_received = self
            .db
            .receiver_tokens(message.id)?
            .iter()
            .any(|token| token.state.is_received());
        if retrieved || token_received {
            return Err(CoreError::ImmutableAfterReceipt(message.id));
        }
        Ok(())
    }

    /// Encrypt into a spool under a fresh key and wrap it per recipient.
    fn seal<P, K>(
        &self,
        plaintext: P,
        recipients: &[K],
        algorithm: HashAlgorithm,
        header: &EnvelopeHeader,
    ) -> Result<Sealed>
    where
        P: Read,
        K: AsRef<[u8]>,
    {
        let limit = self.config.limits.max_payload_size;
        let (key, mut encoder) = encode(plaintext, header)?;
        let mut spool = self.blobs.spool()?;
        let written = io::copy(&mut (&mut encoder).take(limit.saturating_add(1)), &mut spool)?;
        if written > limit {
            return Err(CoreError::PayloadTooLarge {
                size: Some(written),
                limit,
            });
        }

        let (key_list, failures) = wrap_for_recipients(&key, recipients, algorithm)?;
        if key_list.is_empty() {
            return Err(ProtocolError::EmptyKeyList.into());
        }
        if self.config.send.require_all_recipients && !failures.is_empty() {
            return Err(CoreError::PartialKeyList {
                failed: failures.len(),
            });
        }
        Ok(Sealed {
            spool,
            key_list,
            failures,
        })
    }

    fn store_envelope(&self, spool: Spool, owner: &str) -> Result<(String, u64)> {
        let size = spool.len();
        self.db
            .charge_quota(owner, size, self.config.limits.max_used_space)?;
        match self.blobs.commit(spool, BlobArea::Sending, owner) {
            Ok(blob) => Ok((blob.token, size)),
            Err(e) => {
                self.db.release_quota(owner, size)?;
                Err(e.into())
            }
        }
    }

    fn discard_envelope(&self, owner: &str, token: &str, size: u64) -> Result<()> {
        self.blobs.remove(BlobArea::Sending, owner, token)?;
        self.db.release_quota(owner, size)?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExchange")
            .field("config", &self.config)
            .field("db", &self.db)
            .field("blobs", &self.blobs)
            .finish_non_exhaustive()
    }
}

fn current_attestation(postbox: &PostboxRecord) -> Result<Option<Attestation>> {
    postbox
        .attestation
        .as_deref()
        .map(Attestation::from_b64)
        .transpose()
        .map_err(CoreError::from)
}

fn missing_target(error: StoreError, target: TrackerTarget) -> CoreError {
    match (error, target) {
        (StoreError::NotFound(_), TrackerTarget::Message(id)) => CoreError::MessageNotFound(id),
        (StoreError::NotFound(_), TrackerTarget::Reference(id)) => CoreError::ReferenceGone(id),
        (other, _) => other.into(),
    }
}

/// Wrap `key` for every recipient, collecting per-recipient failures.
fn wrap_for_recipients<K: AsRef<[u8]>>(
    key: &ContentKey,
    recipients: &[K],
    algorithm: HashAlgorithm,
) -> Result<(KeyList, Vec<RecipientFailure>)> {
    let mut key_list = KeyList::new();
    let mut failures = Vec::new();
    for (index, raw) in recipients.iter().enumerate() {
        let wrapped = RecipientPublicKey::parse(raw.as_ref()).and_then(|public_key| {
            Ok((
                public_key.fingerprint(algorithm)?,
                public_key.wrap_key(key, algorithm)?,
            ))
        });
        match wrapped {
            Ok((fingerprint, wrapped)) => key_list.insert(fingerprint, wrapped)?,
            Err(e) => {
                warn!(index, error = %e, "recipient skipped");
                failures.push(RecipientFailure {
                    index,
                    error: e.into(),
                });
            }
        }
    }
    Ok((key_list, failures))
}
