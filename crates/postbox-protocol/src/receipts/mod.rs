//! Delivery tracking for messages and webreferences.
//!
//! Every recipient keyhash of a key list gets its own receipt state:
//!
//! - **Unread**: the recipient has not confirmed retrieval
//! - **Received**: the recipient confirmed retrieval (terminal)
//!
//! The sender's own keyhash (the echo) starts as received and never counts
//! as a retrieval by a recipient.
//!
//! ## Usage
//!
//! ```ignore
//! use postbox_protocol::receipts::DeliveryTracker;
//!
//! let mut tracker = DeliveryTracker::new(["aa", "bb"], Some("bb"));
//! assert!(!tracker.was_retrieved());
//!
//! tracker.mark_received("aa")?;
//! assert!(tracker.was_retrieved());
//! ```

mod delivery;

pub use delivery::{DeliveryTracker, ReceiptState};
