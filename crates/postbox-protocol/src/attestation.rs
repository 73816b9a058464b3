//! Postbox attestations.
//!
//! An attestation is a single digest over the set of active key
//! fingerprints of a postbox. Owners sign it with each of their keys; a
//! sender's key list is accepted only if every entry belongs to a key whose
//! signature verifies against the current attestation.

use std::collections::BTreeSet;

use postbox_crypto::wrap::{decode_b64, encode_b64};
use postbox_crypto::{unhex_fingerprint, HashAlgorithm, RecipientPublicKey};

use crate::error::{ProtocolError, Result};
use crate::key_list::KeyList;

/// Digest over a postbox's active key set.
#[derive(Clone, PartialEq, Eq)]
pub struct Attestation {
    raw: Vec<u8>,
}

impl Attestation {
    /// Compute the attestation for a set of hex fingerprints.
    ///
    /// Fingerprints are deduplicated and sorted before their decoded bytes
    /// are concatenated and digested once.
    ///
    /// # Errors
    ///
    /// Returns an error if a fingerprint is not valid hex.
    pub fn compute<I, S>(algorithm: HashAlgorithm, fingerprints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sorted: BTreeSet<String> = fingerprints
            .into_iter()
            .map(|f| f.as_ref().to_string())
            .collect();
        let mut concatenated = Vec::new();
        for fingerprint in &sorted {
            concatenated.extend_from_slice(&unhex_fingerprint(fingerprint)?);
        }
        Ok(Self {
            raw: algorithm.digest(&concatenated),
        })
    }

    /// Raw digest bytes; this is what keys sign.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// URL-safe base64 form.
    pub fn to_b64(&self) -> String {
        encode_b64(&self.raw)
    }

    /// Parse the URL-safe base64 form.
    pub fn from_b64(text: &str) -> Result<Self> {
        Ok(Self {
            raw: decode_b64(text)?,
        })
    }
}

impl std::fmt::Display for Attestation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_b64())
    }
}

impl std::fmt::Debug for Attestation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Attestation({})", self.to_b64())
    }
}

/// A postbox key as seen by key list verification.
#[derive(Debug, Clone)]
pub struct AttestedKey {
    /// Fingerprint of the key (`pubkeyhash`).
    pub pubkeyhash: String,
    /// Parsed public key.
    pub public_key: RecipientPublicKey,
    /// Signature over the postbox attestation, if the owner set one.
    pub signature: Option<String>,
}

impl AttestedKey {
    /// Whether the stored signature verifies against `attestation`.
    pub fn verifies(&self, attestation: &Attestation, algorithm: HashAlgorithm) -> bool {
        match &self.signature {
            Some(signature) => self
                .public_key
                .verify_attestation(attestation.as_bytes(), signature, algorithm)
                .is_ok(),
            None => false,
        }
    }
}

/// Check a sender's key list against the postbox keys.
///
/// Counts the postbox keys whose fingerprint appears in the key list and
/// whose signature verifies against `attestation`. Any difference from the
/// number of key list entries rejects the whole list.
///
/// Returns the number of verified entries.
pub fn verify_key_list(
    key_list: &KeyList,
    keys: &[AttestedKey],
    attestation: &Attestation,
    algorithm: HashAlgorithm,
) -> Result<usize> {
    if key_list.is_empty() {
        return Err(ProtocolError::EmptyKeyList);
    }
    let verified = keys
        .iter()
        .filter(|key| key_list.contains(&key.pubkeyhash))
        .filter(|key| key.verifies(attestation, algorithm))
        .count();
    if verified != key_list.len() {
        return Err(ProtocolError::KeyListMismatch {
            expected: key_list.len(),
            actual: verified,
        });
    }
    Ok(verified)
}
