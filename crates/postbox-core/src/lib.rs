//! # postbox-core
//!
//! High-level API for postbox messaging.
//!
//! This is the main entry point for applications embedding a postbox
//! server.
//!
//! ## Quick Start
//!
//! ```ignore
//! use postbox_core::{ExchangeConfig, MessageExchange, PostboxOptions, SendOptions};
//!
//! let exchange = MessageExchange::new(ExchangeConfig::default())?;
//! let postbox = exchange.create_postbox("alice", PostboxOptions::default())?;
//! exchange.add_key(postbox.id, &alice_public_pem)?;
//!
//! let report = exchange.send("alice", &b"hello"[..], &[bob_pem, carol_pem], SendOptions::default())?;
//! println!("stored message {} for {} recipients", report.message_id, report.key_list.len());
//! ```
//!
//! ## Webreferences
//!
//! Senders push references to externally hosted envelopes. A reference is
//! accepted only if its key list matches the postbox keys whose signatures
//! verify against the current attestation. Message references are fetched
//! once through the [`ContentCache`] and then served locally.
//!
//! ## Architecture
//!
//! - **MessageExchange**: postboxes, sending, updates, receipts, lifecycle
//! - **ContentCache**: single-flight fetch, quota charging, cache slots
//! - **RemoteSource**: transport for fetches, [`HttpSource`] by default
//! - **Recipient**: unwrap and decode on the receiving side

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fetch;
pub mod recipient;

mod guard;

pub use cache::{CachedContent, ContentCache};
pub use config::{ConfigError, ExchangeConfig, ExchangeConfigBuilder};
pub use error::{CoreError, Result};
pub use exchange::{
    KeyInfo, MessageExchange, MessageUpdate, MessageView, NewReference, PostboxInfo,
    PostboxOptions, RecipientFailure, ReferenceAccess, SendOptions, SendReport,
};
pub use fetch::{FetchRequest, HttpSource, RemoteBody, RemoteSource, RequestContext};
pub use recipient::Recipient;

// Re-export commonly used types from lower crates
pub use postbox_crypto::{EnvelopeHeader, HashAlgorithm, RecipientPrivateKey, RecipientPublicKey};
pub use postbox_protocol::{DeliveryTracker, KeyList, ReceiptState, ReferenceType, StatusCode};
pub use postbox_store::{MessageId, PostboxId, ReferenceId, TrackerTarget};
