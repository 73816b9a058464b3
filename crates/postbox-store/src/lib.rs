//! # postbox-store
//!
//! Local storage for postbox messaging.
//!
//! Provides:
//! - Row store for postboxes, keys, webreferences, messages, receipts and
//!   per-owner quota counters, backed by sled
//! - Blob slots on the filesystem with spool-then-commit writes
//!
//! ```no_run
//! use postbox_crypto::HashAlgorithm;
//! use postbox_store::{PostboxDb, PostboxRecord};
//! use std::path::Path;
//!
//! let db = PostboxDb::open(Path::new("/tmp/postbox-db")).unwrap();
//! let postbox = db
//!     .insert_postbox(PostboxRecord::new("alice", HashAlgorithm::Sha512))
//!     .unwrap();
//! assert!(db.get_postbox(postbox.id).unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blobs;
pub mod db;
pub mod error;
pub mod records;

pub use blobs::{random_token, BlobArea, BlobStore, Spool, StoredBlob};
pub use db::{CascadeReport, PostboxDb};
pub use error::{Result, StoreError};
pub use records::{
    KeyRecord, MessageId, MessageRecord, PostboxId, PostboxRecord, ReceiverToken, ReferenceId,
    ReferenceRecord, TrackerTarget,
};
