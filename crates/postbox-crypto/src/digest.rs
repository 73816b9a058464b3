//! Digest algorithms used for fingerprints, key wrapping and attestations.
//!
//! The algorithm is chosen per postbox, message or webreference and is
//! carried by name (`"SHA512"` etc.) alongside the stored records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::{CryptoError, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    #[default]
    Sha512,
}

impl HashAlgorithm {
    /// Canonical name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        }
    }

    /// Digest output size in bytes.
    pub fn output_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Digest a single input.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest a single input and format it as lowercase hex.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(CryptoError::InvalidHashAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HashAlgorithm> for String {
    fn from(value: HashAlgorithm) -> Self {
        value.name().to_string()
    }
}

/// Decode a hex fingerprint into raw bytes.
///
/// # Errors
///
/// Returns `InvalidHexFormat` if the string is not valid hex.
pub fn unhex_fingerprint(fingerprint: &str) -> Result<Vec<u8>> {
    hex::decode(fingerprint)
        .map_err(|e| CryptoError::InvalidHexFormat(format!("{fingerprint:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("SHA512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("SHA-384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
    }

    #[test]
    fn test_parse_unknown_rejected() {
        let result = "MD5".parse::<HashAlgorithm>();
        assert!(matches!(result, Err(CryptoError::InvalidHashAlgorithm(_))));
    }

    #[test]
    fn test_default_is_sha512() {
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha512);
    }

    #[test]
    fn test_output_sizes() {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Sha384, HashAlgorithm::Sha512] {
            assert_eq!(algo.digest(b"abc").len(), algo.output_size());
            assert_eq!(algo.hex_digest(b"abc").len(), algo.output_size() * 2);
        }
    }

    #[test]
    fn test_known_sha256_vector() {
        assert_eq!(
            HashAlgorithm::Sha256.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_unhex_invalid() {
        assert!(matches!(
            unhex_fingerprint("zz"),
            Err(CryptoError::InvalidHexFormat(_))
        ));
        assert_eq!(unhex_fingerprint("00ff").unwrap(), vec![0x00, 0xff]);
    }
}
