//! Configuration for the message exchange.
//!
//! # Example
//!
//! ```
//! use postbox_core::config::{ExchangeConfig, ExchangeConfigBuilder};
//! use std::time::Duration;
//!
//! // Use defaults
//! let config = ExchangeConfig::default();
//!
//! // Or use builder for customization
//! let config = ExchangeConfigBuilder::new()
//!     .with_in_memory_storage()
//!     .with_max_payload_size(1024 * 1024)
//!     .with_fetch_timeout(Duration::from_secs(10))
//!     .build();
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use postbox_crypto::HashAlgorithm;
use postbox_protocol::limits::{
    DEFAULT_AMOUNT_TOKENS, DEFAULT_FETCH_CHUNK_SIZE, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_MAX_USED_SPACE, MAX_AMOUNT_TOKENS,
};

/// Default directory for the row store and blobs.
const DEFAULT_DATA_DIR: &str = "postbox_messages";

/// Exchange configuration.
///
/// Passed explicitly to [`crate::MessageExchange`]; there is no global
/// configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Storage configuration.
    pub storage: StorageConfig,

    /// Size and quota limits.
    pub limits: LimitsConfig,

    /// Cryptographic defaults.
    pub crypto: CryptoConfig,

    /// Webreference fetching.
    pub fetch: FetchConfig,

    /// Message sending.
    pub send: SendConfig,
}

impl ExchangeConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    pub fn builder() -> ExchangeConfigBuilder {
        ExchangeConfigBuilder::new()
    }

    /// Configuration with temporary storage, for tests and embedding.
    pub fn in_memory() -> Self {
        ExchangeConfigBuilder::new().with_in_memory_storage().build()
    }

    /// Validate the configuration.
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.storage.in_memory && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.data_dir".into(),
                reason: "data directory cannot be empty when not using in-memory storage".into(),
            });
        }

        if self.limits.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_payload_size".into(),
                reason: "max payload size must be greater than zero".into(),
            });
        }

        if self.limits.max_used_space < self.limits.max_payload_size {
            return Err(ConfigError::InvalidValue {
                field: "limits.max_used_space".into(),
                reason: "quota must be at least the max payload size".into(),
            });
        }

        if self.fetch.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "fetch.timeout".into(),
                reason: "fetch timeout must be greater than zero".into(),
            });
        }

        if self.fetch.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.chunk_size".into(),
                reason: "chunk size must be greater than zero".into(),
            });
        }

        if self.send.default_amount_tokens > MAX_AMOUNT_TOKENS {
            return Err(ConfigError::InvalidValue {
                field: "send.default_amount_tokens".into(),
                reason: format!("at most {} receiver tokens per message", MAX_AMOUNT_TOKENS),
            });
        }

        Ok(())
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the row store and blob slots.
    pub data_dir: PathBuf,

    /// Use a temporary database and blob directory.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            in_memory: false,
        }
    }
}

/// Size and quota limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted envelope, uploaded or fetched.
    pub max_payload_size: u64,

    /// Storage quota per owner.
    pub max_used_space: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_used_space: DEFAULT_MAX_USED_SPACE,
        }
    }
}

/// Cryptographic defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Digest for new postboxes and messages when none is given.
    pub hash_algorithm: HashAlgorithm,
}

/// Webreference fetching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout for a whole fetch.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Spool write granularity.
    pub chunk_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            chunk_size: DEFAULT_FETCH_CHUNK_SIZE,
        }
    }
}

/// Message sending.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendConfig {
    /// Reject a send if wrapping fails for any recipient.
    pub require_all_recipients: bool,

    /// Receiver tokens issued for a new message.
    pub default_amount_tokens: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            require_all_recipients: false,
            default_amount_tokens: DEFAULT_AMOUNT_TOKENS,
        }
    }
}

/// Builder for [`ExchangeConfig`].
#[derive(Clone, Debug, Default)]
pub struct ExchangeConfigBuilder {
    config: ExchangeConfig,
}

impl ExchangeConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ExchangeConfig::default(),
        }
    }

    /// Build the configuration.
    pub fn build(self) -> ExchangeConfig {
        self.config
    }

    /// Build and validate the configuration.
    pub fn build_validated(self) -> Result<ExchangeConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }

    // ===== Storage Configuration =====

    /// Set the data directory.
    pub fn with_data_dir(mut self, path: PathBuf) -> Self {
        self.config.storage.data_dir = path;
        self
    }

    /// Use temporary storage.
    pub fn with_in_memory_storage(mut self) -> Self {
        self.config.storage.in_memory = true;
        self
    }

    /// Use persistent storage under the data directory (default).
    pub fn with_disk_storage(mut self) -> Self {
        self.config.storage.in_memory = false;
        self
    }

    // ===== Limits =====

    /// Set the maximum payload size.
    pub fn with_max_payload_size(mut self, bytes: u64) -> Self {
        self.config.limits.max_payload_size = bytes;
        self
    }

    /// Set the per-owner quota.
    pub fn with_max_used_space(mut self, bytes: u64) -> Self {
        self.config.limits.max_used_space = bytes;
        self
    }

    // ===== Crypto =====

    /// Set the default digest algorithm.
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.crypto.hash_algorithm = algorithm;
        self
    }

    // ===== Fetching =====

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch.timeout = timeout;
        self
    }

    /// Set the spool write granularity.
    pub fn with_fetch_chunk_size(mut self, bytes: usize) -> Self {
        self.config.fetch.chunk_size = bytes;
        self
    }

    // ===== Sending =====

    /// Reject sends with any failed recipient.
    pub fn require_all_recipients(mut self) -> Self {
        self.config.send.require_all_recipients = true;
        self
    }

    /// Accept sends with partial recipient failures (default).
    pub fn allow_partial_recipients(mut self) -> Self {
        self.config.send.require_all_recipients = false;
        self
    }

    /// Set how many receiver tokens a new message gets.
    pub fn with_default_amount_tokens(mut self, amount: usize) -> Self {
        self.config.send.default_amount_tokens = amount;
        self
    }
}

/// Configuration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The field name.
        field: String,
        /// The reason it's invalid.
        reason: String,
    },
}

/// Serde support for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serializable representation of Duration.
    #[derive(Serialize, Deserialize)]
    struct DurationRepr {
        secs: u64,
        nanos: u32,
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let repr = DurationRepr {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = DurationRepr::deserialize(deserializer)?;
        Ok(Duration::new(repr.secs, repr.nanos))
    }
}
