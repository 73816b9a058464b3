//! Opening content on the recipient side.

use std::io::{Read, Seek};

use postbox_crypto::{
    decode, decode_slice, DecodedEnvelope, EnvelopeHeader, HashAlgorithm, RecipientPrivateKey,
};
use postbox_protocol::KeyList;

use crate::{CoreError, Result};

/// A recipient holding a private key.
#[derive(Debug, Clone)]
pub struct Recipient {
    private_key: RecipientPrivateKey,
    hash_algorithm: HashAlgorithm,
    fingerprint: String,
}

impl Recipient {
    /// Create a recipient; fingerprints and unwrapping use `hash_algorithm`.
    pub fn new(private_key: RecipientPrivateKey, hash_algorithm: HashAlgorithm) -> Result<Self> {
        let fingerprint = private_key.public_key()?.fingerprint(hash_algorithm)?;
        Ok(Self {
            private_key,
            hash_algorithm,
            fingerprint,
        })
    }

    /// Own fingerprint, the key list entry name.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Digest algorithm.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Verify and open an envelope using this recipient's key list entry.
    ///
    /// # Errors
    ///
    /// - `NotARecipient` if the key list has no entry for this key
    /// - `Crypto(Unwrap)` if the entry was not wrapped for this key
    /// - `Crypto(Integrity)` or `Crypto(MalformedEnvelope)` for bad envelopes
    pub fn open<R: Read + Seek>(
        &self,
        envelope: R,
        key_list: &KeyList,
    ) -> Result<DecodedEnvelope<R>> {
        let wrapped = key_list
            .get(&self.fingerprint)
            .ok_or(CoreError::NotARecipient)?;
        let key = self.private_key.unwrap_key(wrapped, self.hash_algorithm)?;
        Ok(decode(envelope, &key)?)
    }

    /// Open an in-memory envelope.
    pub fn open_bytes(&self, envelope: &[u8], key_list: &KeyList) -> Result<(EnvelopeHeader, Vec<u8>)> {
        let wrapped = key_list
            .get(&self.fingerprint)
            .ok_or(CoreError::NotARecipient)?;
        let key = self.private_key.unwrap_key(wrapped, self.hash_algorithm)?;
        Ok(decode_slice(envelope, &key)?)
    }
}
