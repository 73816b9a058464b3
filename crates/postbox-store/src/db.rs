//! Row store for postboxes, keys, webreferences, messages and receipts.
//!
//! Backed by sled with one tree per record kind. Records are bincode
//! encoded and keyed by big-endian ids so prefix scans list the rows of one
//! postbox. Deleting a postbox cascades to everything it owns; blob cleanup
//! and quota refunds are left to the caller, which receives the deleted
//! records.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use postbox_protocol::{DeliveryTracker, ReceiptState};

use crate::error::db_err;
use crate::records::{
    KeyRecord, MessageId, MessageRecord, PostboxId, PostboxRecord, ReceiverToken, ReferenceId,
    ReferenceRecord, TrackerTarget,
};
use crate::{Result, StoreError};

const POSTBOX_TREE: &str = "postboxes";
const OWNER_TREE: &str = "postbox_owners";
const KEY_TREE: &str = "keys";
const REFERENCE_TREE: &str = "references";
const POSTBOX_REFERENCE_TREE: &str = "postbox_references";
const MESSAGE_TREE: &str = "messages";
const POSTBOX_MESSAGE_TREE: &str = "postbox_messages";
const RECEIVER_TREE: &str = "receivers";
const RECEIPT_TREE: &str = "receipts";
const QUOTA_TREE: &str = "quota";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| StoreError::Serialization(format!("Failed to serialize: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::Serialization(format!("Failed to deserialize: {}", e)))
}

fn pair_key(first: u64, second: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + second.len());
    key.extend_from_slice(&first.to_be_bytes());
    key.extend_from_slice(second);
    key
}

fn decode_counter(bytes: Option<&[u8]>) -> Result<u64> {
    match bytes {
        None => Ok(0),
        Some(b) => {
            let arr: [u8; 8] = b
                .try_into()
                .map_err(|_| StoreError::Corruption("quota counter length".into()))?;
            Ok(u64::from_be_bytes(arr))
        }
    }
}

/// Records removed by deleting a postbox.
#[derive(Debug, Default)]
pub struct CascadeReport {
    /// Deleted webreferences.
    pub references: Vec<ReferenceRecord>,
    /// Deleted messages.
    pub messages: Vec<MessageRecord>,
    /// Number of deleted keys.
    pub keys: usize,
}

/// Row store handle. Cloning shares the underlying database.
#[derive(Clone)]
pub struct PostboxDb {
    db: sled::Db,
    postboxes: sled::Tree,
    owners: sled::Tree,
    keys: sled::Tree,
    references: sled::Tree,
    postbox_references: sled::Tree,
    messages: sled::Tree,
    postbox_messages: sled::Tree,
    receivers: sled::Tree,
    receipts: sled::Tree,
    quota: sled::Tree,
}

impl std::fmt::Debug for PostboxDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostboxDb")
            .field("postboxes", &self.postboxes.len())
            .finish_non_exhaustive()
    }
}

impl PostboxDb {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .open()
            .map_err(db_err("Failed to open database"))?;
        info!(path = %path.display(), "row store opened");
        Self::from_db(db)
    }

    /// Open a temporary database that is removed when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(db_err("Failed to open temporary database"))?;
        Self::from_db(db)
    }

    /// Use an already opened sled database.
    pub fn from_db(db: sled::Db) -> Result<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(db_err("Failed to open tree"));
        Ok(Self {
            postboxes: tree(POSTBOX_TREE)?,
            owners: tree(OWNER_TREE)?,
            keys: tree(KEY_TREE)?,
            references: tree(REFERENCE_TREE)?,
            postbox_references: tree(POSTBOX_REFERENCE_TREE)?,
            messages: tree(MESSAGE_TREE)?,
            postbox_messages: tree(POSTBOX_MESSAGE_TREE)?,
            receivers: tree(RECEIVER_TREE)?,
            receipts: tree(RECEIPT_TREE)?,
            quota: tree(QUOTA_TREE)?,
            db,
        })
    }

    fn next_id(&self) -> Result<u64> {
        // ids start at 1 so 0 can mark unsaved records
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(db_err("Failed to generate id"))
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(db_err("Failed to flush"))?;
        Ok(())
    }

    // =======================================================================
    // Postboxes
    // =======================================================================

    /// Insert a new postbox, assigning its id.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the owner already has a postbox.
    pub fn insert_postbox(&self, mut record: PostboxRecord) -> Result<PostboxRecord> {
        record.id = self.next_id()?;
        let claimed = self
            .owners
            .compare_and_swap(
                record.owner.as_bytes(),
                None::<&[u8]>,
                Some(&record.id.to_be_bytes()[..]),
            )
            .map_err(db_err("Failed to claim owner"))?;
        if claimed.is_err() {
            return Err(StoreError::AlreadyExists(format!(
                "postbox for owner {}",
                record.owner
            )));
        }
        self.postboxes
            .insert(record.id.to_be_bytes(), encode(&record)?)
            .map_err(db_err("Failed to insert postbox"))?;
        debug!(postbox = record.id, owner = %record.owner, "postbox created");
        Ok(record)
    }

    /// Get a postbox by id.
    pub fn get_postbox(&self, id: PostboxId) -> Result<Option<PostboxRecord>> {
        self.postboxes
            .get(id.to_be_bytes())
            .map_err(db_err("Failed to get postbox"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Get the postbox of an owner.
    pub fn postbox_for_owner(&self, owner: &str) -> Result<Option<PostboxRecord>> {
        let Some(id) = self
            .owners
            .get(owner.as_bytes())
            .map_err(db_err("Failed to get owner"))?
        else {
            return Ok(None);
        };
        let id = decode_counter(Some(id.as_ref()))?;
        self.get_postbox(id)
    }

    /// Replace a stored postbox.
    pub fn update_postbox(&self, record: &PostboxRecord) -> Result<()> {
        if !self
            .postboxes
            .contains_key(record.id.to_be_bytes())
            .map_err(db_err("Failed to check postbox"))?
        {
            return Err(StoreError::NotFound(format!("postbox {}", record.id)));
        }
        self.postboxes
            .insert(record.id.to_be_bytes(), encode(record)?)
            .map_err(db_err("Failed to update postbox"))?;
        Ok(())
    }

    /// Delete a postbox with its keys, references, messages and receipts.
    pub fn delete_postbox(&self, id: PostboxId) -> Result<CascadeReport> {
        let record = self
            .get_postbox(id)?
            .ok_or_else(|| StoreError::NotFound(format!("postbox {}", id)))?;

        let mut report = CascadeReport::default();
        for key in self.keys_for_postbox(id)? {
            self.keys
                .remove(pair_key(id, key.pubkeyhash.as_bytes()))
                .map_err(db_err("Failed to delete key"))?;
            report.keys += 1;
        }
        for reference in self.references_for_postbox(id)? {
            if let Some(removed) = self.delete_reference(reference.id)? {
                report.references.push(removed);
            }
        }
        for message in self.messages_for_postbox(id)? {
            if let Some(removed) = self.delete_message(message.id)? {
                report.messages.push(removed);
            }
        }

        self.postboxes
            .remove(id.to_be_bytes())
            .map_err(db_err("Failed to delete postbox"))?;
        self.owners
            .remove(record.owner.as_bytes())
            .map_err(db_err("Failed to release owner"))?;
        info!(
            postbox = id,
            references = report.references.len(),
            messages = report.messages.len(),
            keys = report.keys,
            "postbox deleted"
        );
        Ok(report)
    }

    // =======================================================================
    // Keys
    // =======================================================================

    /// Insert or replace a key of a postbox.
    pub fn put_key(&self, record: &KeyRecord) -> Result<()> {
        self.keys
            .insert(
                pair_key(record.postbox_id, record.pubkeyhash.as_bytes()),
                encode(record)?,
            )
            .map_err(db_err("Failed to store key"))?;
        Ok(())
    }

    /// Get one key of a postbox.
    pub fn get_key(&self, postbox_id: PostboxId, pubkeyhash: &str) -> Result<Option<KeyRecord>> {
        self.keys
            .get(pair_key(postbox_id, pubkeyhash.as_bytes()))
            .map_err(db_err("Failed to get key"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Remove a key, returning it if present.
    pub fn remove_key(&self, postbox_id: PostboxId, pubkeyhash: &str) -> Result<Option<KeyRecord>> {
        self.keys
            .remove(pair_key(postbox_id, pubkeyhash.as_bytes()))
            .map_err(db_err("Failed to remove key"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// All keys of a postbox.
    pub fn keys_for_postbox(&self, postbox_id: PostboxId) -> Result<Vec<KeyRecord>> {
        self.keys
            .scan_prefix(postbox_id.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry.map_err(db_err("Failed to scan keys"))?;
                decode(&value)
            })
            .collect()
    }

    // =======================================================================
    // Webreferences
    // =======================================================================

    /// Insert a new webreference, assigning its id.
    pub fn insert_reference(&self, mut record: ReferenceRecord) -> Result<ReferenceRecord> {
        record.id = self.next_id()?;
        self.references
            .insert(record.id.to_be_bytes(), encode(&record)?)
            .map_err(db_err("Failed to insert reference"))?;
        self.postbox_references
            .insert(pair_key(record.postbox_id, &record.id.to_be_bytes()), Vec::<u8>::new())
            .map_err(db_err("Failed to index reference"))?;
        Ok(record)
    }

    /// Get a webreference by id.
    pub fn get_reference(&self, id: ReferenceId) -> Result<Option<ReferenceRecord>> {
        self.references
            .get(id.to_be_bytes())
            .map_err(db_err("Failed to get reference"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Replace a stored webreference.
    pub fn update_reference(&self, record: &ReferenceRecord) -> Result<()> {
        if !self
            .references
            .contains_key(record.id.to_be_bytes())
            .map_err(db_err("Failed to check reference"))?
        {
            return Err(StoreError::NotFound(format!("reference {}", record.id)));
        }
        self.references
            .insert(record.id.to_be_bytes(), encode(record)?)
            .map_err(db_err("Failed to update reference"))?;
        Ok(())
    }

    /// Delete a webreference and its receipts, returning it if present.
    pub fn delete_reference(&self, id: ReferenceId) -> Result<Option<ReferenceRecord>> {
        let Some(value) = self
            .references
            .remove(id.to_be_bytes())
            .map_err(db_err("Failed to delete reference"))?
        else {
            return Ok(None);
        };
        let record: ReferenceRecord = decode(&value)?;
        self.postbox_references
            .remove(pair_key(record.postbox_id, &id.to_be_bytes()))
            .map_err(db_err("Failed to unindex reference"))?;
        self.remove_tracker(TrackerTarget::Reference(id))?;
        Ok(Some(record))
    }

    /// All webreferences of a postbox.
    pub fn references_for_postbox(&self, postbox_id: PostboxId) -> Result<Vec<ReferenceRecord>> {
        self.index_scan(&self.postbox_references, postbox_id)?
            .into_iter()
            .filter_map(|id| self.get_reference(id).transpose())
            .collect()
    }

    // =======================================================================
    // Messages
    // =======================================================================

    /// Insert a new message, assigning its id.
    pub fn insert_message(&self, mut record: MessageRecord) -> Result<MessageRecord> {
        record.id = self.next_id()?;
        self.messages
            .insert(record.id.to_be_bytes(), encode(&record)?)
            .map_err(db_err("Failed to insert message"))?;
        self.postbox_messages
            .insert(pair_key(record.postbox_id, &record.id.to_be_bytes()), Vec::<u8>::new())
            .map_err(db_err("Failed to index message"))?;
        Ok(record)
    }

    /// Get a message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        self.messages
            .get(id.to_be_bytes())
            .map_err(db_err("Failed to get message"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Replace a stored message.
    pub fn update_message(&self, record: &MessageRecord) -> Result<()> {
        if !self
            .messages
            .contains_key(record.id.to_be_bytes())
            .map_err(db_err("Failed to check message"))?
        {
            return Err(StoreError::NotFound(format!("message {}", record.id)));
        }
        self.messages
            .insert(record.id.to_be_bytes(), encode(record)?)
            .map_err(db_err("Failed to update message"))?;
        Ok(())
    }

    /// Delete a message with its receipts and receiver tokens.
    pub fn delete_message(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let Some(value) = self
            .messages
            .remove(id.to_be_bytes())
            .map_err(db_err("Failed to delete message"))?
        else {
            return Ok(None);
        };
        let record: MessageRecord = decode(&value)?;
        self.postbox_messages
            .remove(pair_key(record.postbox_id, &id.to_be_bytes()))
            .map_err(db_err("Failed to unindex message"))?;
        self.remove_tracker(TrackerTarget::Message(id))?;
        for entry in self.receivers.scan_prefix(id.to_be_bytes()).keys() {
            let key = entry.map_err(db_err("Failed to scan receivers"))?;
            self.receivers
                .remove(key)
                .map_err(db_err("Failed to delete receiver"))?;
        }
        Ok(Some(record))
    }

    /// All messages of a postbox.
    pub fn messages_for_postbox(&self, postbox_id: PostboxId) -> Result<Vec<MessageRecord>> {
        self.index_scan(&self.postbox_messages, postbox_id)?
            .into_iter()
            .filter_map(|id| self.get_message(id).transpose())
            .collect()
    }

    fn index_scan(&self, index: &sled::Tree, postbox_id: PostboxId) -> Result<Vec<u64>> {
        index
            .scan_prefix(postbox_id.to_be_bytes())
            .keys()
            .map(|entry| {
                let key = entry.map_err(db_err("Failed to scan index"))?;
                let arr: [u8; 8] = key
                    .get(8..16)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| StoreError::Corruption("index key length".into()))?;
                Ok(u64::from_be_bytes(arr))
            })
            .collect()
    }

    // =======================================================================
    // Receiver tokens
    // =======================================================================

    /// Register unread receiver tokens for a message.
    pub fn add_receiver_tokens(&self, message_id: MessageId, tokens: &[String]) -> Result<()> {
        let unread = encode(&ReceiptState::Unread)?;
        for token in tokens {
            self.receivers
                .insert(pair_key(message_id, token.as_bytes()), unread.clone())
                .map_err(db_err("Failed to store receiver token"))?;
        }
        Ok(())
    }

    /// All receiver tokens of a message.
    pub fn receiver_tokens(&self, message_id: MessageId) -> Result<Vec<ReceiverToken>> {
        self.receivers
            .scan_prefix(message_id.to_be_bytes())
            .map(|entry| {
                let (key, value) = entry.map_err(db_err("Failed to scan receivers"))?;
                let token = std::str::from_utf8(&key[8..])
                    .map_err(|_| StoreError::Corruption("receiver token".into()))?
                    .to_string();
                Ok(ReceiverToken {
                    message_id,
                    token,
                    state: decode(&value)?,
                })
            })
            .collect()
    }

    /// Mark a receiver token as received.
    ///
    /// Returns `true` if the state changed.
    pub fn mark_token_received(&self, message_id: MessageId, token: &str) -> Result<bool> {
        let key = pair_key(message_id, token.as_bytes());
        let received = encode(&ReceiptState::Received)?;
        let previous = self
            .receivers
            .fetch_and_update(&key, |old| old.map(|_| received.clone()))
            .map_err(db_err("Failed to update receiver token"))?
            .ok_or_else(|| StoreError::NotFound(format!("receiver token for message {}", message_id)))?;
        let previous: ReceiptState = decode(&previous)?;
        Ok(!previous.is_received())
    }

    // =======================================================================
    // Delivery trackers
    // =======================================================================

    /// Store a tracker, replacing any previous one.
    pub fn put_tracker(&self, target: TrackerTarget, tracker: &DeliveryTracker) -> Result<()> {
        self.receipts
            .insert(target.to_key(), encode(tracker)?)
            .map_err(db_err("Failed to store tracker"))?;
        Ok(())
    }

    /// Get the tracker of a target.
    pub fn get_tracker(&self, target: TrackerTarget) -> Result<Option<DeliveryTracker>> {
        self.receipts
            .get(target.to_key())
            .map_err(db_err("Failed to get tracker"))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Apply `change` to a stored tracker atomically.
    ///
    /// `change` may run more than once if another writer interferes; its
    /// result from the successful run is returned.
    pub fn update_tracker<R, F>(&self, target: TrackerTarget, mut change: F) -> Result<R>
    where
        F: FnMut(&mut DeliveryTracker) -> Result<R>,
    {
        let key = target.to_key();
        loop {
            let current = self
                .receipts
                .get(key)
                .map_err(db_err("Failed to get tracker"))?
                .ok_or_else(|| StoreError::NotFound(format!("tracker for {}", target)))?;
            let mut tracker: DeliveryTracker = decode(&current)?;
            let result = change(&mut tracker)?;
            let swapped = self
                .receipts
                .compare_and_swap(key, Some(&current), Some(encode(&tracker)?))
                .map_err(db_err("Failed to update tracker"))?;
            if swapped.is_ok() {
                return Ok(result);
            }
            debug!(%target, "tracker changed concurrently, retrying");
        }
    }

    fn remove_tracker(&self, target: TrackerTarget) -> Result<()> {
        self.receipts
            .remove(target.to_key())
            .map_err(db_err("Failed to delete tracker"))?;
        Ok(())
    }

    // =======================================================================
    // Quota
    // =======================================================================

    /// Bytes currently charged to an owner.
    pub fn used_space(&self, owner: &str) -> Result<u64> {
        let value = self
            .quota
            .get(owner.as_bytes())
            .map_err(db_err("Failed to read quota"))?;
        decode_counter(value.as_deref())
    }

    /// Atomically charge `bytes` to an owner.
    ///
    /// Returns the new total.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` without charging anything if the total would
    /// exceed `limit`.
    pub fn charge_quota(&self, owner: &str, bytes: u64, limit: u64) -> Result<u64> {
        loop {
            let current = self
                .quota
                .get(owner.as_bytes())
                .map_err(db_err("Failed to read quota"))?;
            let used = decode_counter(current.as_deref())?;
            let total = used.saturating_add(bytes);
            if total > limit {
                return Err(StoreError::QuotaExceeded {
                    used,
                    requested: bytes,
                    limit,
                });
            }
            let swapped = self
                .quota
                .compare_and_swap(owner.as_bytes(), current, Some(&total.to_be_bytes()[..]))
                .map_err(db_err("Failed to update quota"))?;
            if swapped.is_ok() {
                debug!(owner, bytes, total, "quota charged");
                return Ok(total);
            }
        }
    }

    /// Return `bytes` to an owner's quota. Never goes below zero.
    pub fn release_quota(&self, owner: &str, bytes: u64) -> Result<u64> {
        let mut total = 0;
        self.quota
            .fetch_and_update(owner.as_bytes(), |old| {
                let used = old
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                total = used.saturating_sub(bytes);
                Some(total.to_be_bytes().to_vec())
            })
            .map_err(db_err("Failed to release quota"))?;
        debug!(owner, bytes, total, "quota released");
        Ok(total)
    }
}
