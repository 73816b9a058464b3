//! # postbox-protocol
//!
//! Shared protocol types for postbox messaging.
//!
//! This crate provides:
//! - **KeyList**: recipient fingerprint to wrapped content key
//! - **Attestation**: digest over a postbox's active key set, and key list
//!   verification against signed postbox keys
//! - **DeliveryTracker**: per-recipient receipt states
//! - **ReferenceType** and **StatusCode**
//!
//! ## Trust
//!
//! Keys registered on a postbox by its owner are trusted as they are. A key
//! list is only accepted when every entry matches a postbox key that signed
//! the current attestation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attestation;
pub mod error;
pub mod key_list;
pub mod limits;
pub mod receipts;
pub mod reference;
pub mod status;

#[cfg(test)]
mod proptests;

pub use attestation::{verify_key_list, Attestation, AttestedKey};
pub use error::{ProtocolError, Result};
pub use key_list::KeyList;
pub use receipts::{DeliveryTracker, ReceiptState};
pub use reference::ReferenceType;
pub use status::StatusCode;
