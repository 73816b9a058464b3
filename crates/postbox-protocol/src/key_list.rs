//! Key lists: recipient fingerprint to wrapped content key.
//!
//! On the wire a key list is a JSON object
//! `{ "<hex fingerprint>": "<urlsafe base64 wrapped key>" }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use postbox_crypto::unhex_fingerprint;

use crate::error::{ProtocolError, Result};

/// Mapping from recipient fingerprint (`pubkeyhash`) to wrapped content key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyList(BTreeMap<String, String>);

impl KeyList {
    /// Create an empty key list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the wrapped key for a recipient, replacing a previous entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyList` if the fingerprint is not hex.
    pub fn insert(&mut self, fingerprint: impl Into<String>, wrapped: impl Into<String>) -> Result<()> {
        let fingerprint = fingerprint.into();
        validate_fingerprint(&fingerprint)?;
        self.0.insert(fingerprint, wrapped.into());
        Ok(())
    }

    /// Wrapped key for a fingerprint.
    pub fn get(&self, fingerprint: &str) -> Option<&str> {
        self.0.get(fingerprint).map(String::as_str)
    }

    /// Whether the key list has an entry for a fingerprint.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.0.contains_key(fingerprint)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fingerprints in sorted order.
    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Entries in fingerprint order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse the JSON wire form, validating every fingerprint.
    pub fn from_json(json: &str) -> Result<Self> {
        let map: BTreeMap<String, String> =
            serde_json::from_str(json).map_err(|e| ProtocolError::InvalidKeyList(e.to_string()))?;
        for fingerprint in map.keys() {
            validate_fingerprint(fingerprint)?;
        }
        Ok(Self(map))
    }
}

fn validate_fingerprint(fingerprint: &str) -> Result<()> {
    if fingerprint.is_empty() {
        return Err(ProtocolError::InvalidKeyList("empty fingerprint".into()));
    }
    unhex_fingerprint(fingerprint)
        .map(|_| ())
        .map_err(|e| ProtocolError::InvalidKeyList(e.to_string()))
}

impl FromIterator<(String, String)> for KeyList {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
