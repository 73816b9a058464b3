//! Protocol limits and defaults.
//!
//! All limits are defined here for consistent enforcement.

// === Payloads ===

/// Default maximum size of an uploaded or fetched payload (8 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 8 * 1024 * 1024;

/// Default storage quota per owner (256 MiB).
pub const DEFAULT_MAX_USED_SPACE: u64 = 256 * 1024 * 1024;

// === Fetching ===

/// Default timeout for fetching a webreference, in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default spool write granularity for fetched bodies (64 KiB).
pub const DEFAULT_FETCH_CHUNK_SIZE: usize = 64 * 1024;

// === Blob slots ===

/// Attempts at finding a free blob slot before giving up.
pub const MAX_SLOT_ATTEMPTS: usize = 100;

/// Random bytes in a blob slot or receiver token.
pub const TOKEN_BYTES: usize = 18;

// === Messages ===

/// Receiver tokens issued for a new message by default.
pub const DEFAULT_AMOUNT_TOKENS: usize = 1;

/// Upper bound on receiver tokens per message.
pub const MAX_AMOUNT_TOKENS: usize = 100;

/// Name of the response metadata field carrying the key list.
pub const KEYLIST_HEADER: &str = "X-KEYLIST";
