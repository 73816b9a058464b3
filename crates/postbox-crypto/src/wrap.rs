//! Per-recipient wrapping of content keys and attestation signatures.
//!
//! Content keys are wrapped with RSA-OAEP (MGF1 over the configured digest,
//! no label). The same key pairs sign postbox attestations with RSA-PSS.
//! Wrapped keys and signatures travel as URL-safe base64 with padding.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::digest::HashAlgorithm;
use crate::symmetric::ContentKey;
use crate::{CryptoError, Result};

/// Default modulus size for generated key pairs.
pub const DEFAULT_KEY_BITS: usize = 2048;

fn oaep(algorithm: HashAlgorithm) -> Oaep {
    match algorithm {
        HashAlgorithm::Sha256 => Oaep::new::<Sha256>(),
        HashAlgorithm::Sha384 => Oaep::new::<Sha384>(),
        HashAlgorithm::Sha512 => Oaep::new::<Sha512>(),
    }
}

fn pss(algorithm: HashAlgorithm) -> Pss {
    match algorithm {
        HashAlgorithm::Sha256 => Pss::new::<Sha256>(),
        HashAlgorithm::Sha384 => Pss::new::<Sha384>(),
        HashAlgorithm::Sha512 => Pss::new::<Sha512>(),
    }
}

/// Encode bytes as URL-safe base64 with padding.
pub fn encode_b64(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

/// Decode URL-safe base64 with padding.
pub fn decode_b64(text: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(text.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))
}

/// A recipient's public key as registered on a postbox.
#[derive(Clone)]
pub struct RecipientPublicKey {
    key: RsaPublicKey,
    raw: Vec<u8>,
}

impl RecipientPublicKey {
    /// Parse key material: PEM (SubjectPublicKeyInfo, then PKCS#1), then DER
    /// in the same order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if no encoding matches.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let key = parse_public(raw)
            .ok_or_else(|| CryptoError::InvalidKey("unrecognized public key encoding".into()))?;
        Ok(Self {
            key,
            raw: raw.to_vec(),
        })
    }

    /// Key bytes exactly as registered.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Canonical SubjectPublicKeyInfo PEM with LF line endings.
    pub fn spki_pem(&self) -> Result<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Fingerprint used as key_list entry name (`pubkeyhash`): hex digest of
    /// the canonical SPKI PEM.
    pub fn fingerprint(&self, algorithm: HashAlgorithm) -> Result<String> {
        Ok(algorithm.hex_digest(self.spki_pem()?.as_bytes()))
    }

    /// Content hash of the registered key bytes (`hash`).
    pub fn content_hash(&self, algorithm: HashAlgorithm) -> String {
        algorithm.hex_digest(&self.raw)
    }

    /// Wrap a content key for this recipient.
    pub fn wrap_key(&self, key: &ContentKey, algorithm: HashAlgorithm) -> Result<String> {
        let wrapped = self
            .key
            .encrypt(&mut OsRng, oaep(algorithm), key.as_bytes())
            .map_err(|e| CryptoError::Wrap(e.to_string()))?;
        Ok(encode_b64(&wrapped))
    }

    /// Verify a PSS signature over an attestation value.
    pub fn verify_attestation(
        &self,
        attestation: &[u8],
        signature: &str,
        algorithm: HashAlgorithm,
    ) -> Result<()> {
        let signature =
            decode_b64(signature).map_err(|_| CryptoError::SignatureVerification)?;
        let digest = algorithm.digest(attestation);
        self.key
            .verify(pss(algorithm), &digest, &signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl std::fmt::Debug for RecipientPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientPublicKey")
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

fn parse_public(raw: &[u8]) -> Option<RsaPublicKey> {
    if let Ok(text) = std::str::from_utf8(raw) {
        let text = text.trim();
        if let Ok(key) = RsaPublicKey::from_public_key_pem(text) {
            return Some(key);
        }
        if let Ok(key) = RsaPublicKey::from_pkcs1_pem(text) {
            return Some(key);
        }
    }
    RsaPublicKey::from_public_key_der(raw)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(raw))
        .ok()
}

/// A recipient's private key.
///
/// Key material is zeroized on drop by the underlying RSA implementation.
#[derive(Clone)]
pub struct RecipientPrivateKey {
    key: RsaPrivateKey,
}

impl RecipientPrivateKey {
    /// Generate a new key pair.
    pub fn generate(bits: usize) -> Result<Self> {
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self { key })
    }

    /// Parse a private key: PEM (PKCS#8, then PKCS#1), then DER.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let parsed = std::str::from_utf8(raw).ok().and_then(|text| {
            let text = text.trim();
            RsaPrivateKey::from_pkcs8_pem(text)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
                .ok()
        });
        let key = match parsed {
            Some(key) => key,
            None => RsaPrivateKey::from_pkcs8_der(raw)
                .or_else(|_| RsaPrivateKey::from_pkcs1_der(raw))
                .map_err(|_| CryptoError::InvalidKey("unrecognized private key encoding".into()))?,
        };
        Ok(Self { key })
    }

    /// Export as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// The matching public key, registered as its SPKI PEM.
    pub fn public_key(&self) -> Result<RecipientPublicKey> {
        let key = RsaPublicKey::from(&self.key);
        let raw = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .into_bytes();
        Ok(RecipientPublicKey { key, raw })
    }

    /// Unwrap a content key wrapped for this key.
    ///
    /// # Errors
    ///
    /// Returns `Unwrap` if the wrapped key was not produced for this key pair
    /// or has been corrupted.
    pub fn unwrap_key(&self, wrapped: &str, algorithm: HashAlgorithm) -> Result<ContentKey> {
        let wrapped = decode_b64(wrapped).map_err(|_| CryptoError::Unwrap)?;
        let plain = Zeroizing::new(
            self.key
                .decrypt(oaep(algorithm), &wrapped)
                .map_err(|_| CryptoError::Unwrap)?,
        );
        ContentKey::from_bytes(&plain).map_err(|_| CryptoError::Unwrap)
    }

    /// Sign an attestation value with PSS.
    pub fn sign_attestation(&self, attestation: &[u8], algorithm: HashAlgorithm) -> Result<String> {
        let digest = algorithm.digest(attestation);
        let signature = self
            .key
            .sign_with_rng(&mut OsRng, pss(algorithm), &digest)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(encode_b64(&signature))
    }
}

impl std::fmt::Debug for RecipientPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecipientPrivateKey([REDACTED])")
    }
}

/// Wrap `key` for one recipient.
pub fn wrap(
    key: &ContentKey,
    recipient: &RecipientPublicKey,
    algorithm: HashAlgorithm,
) -> Result<String> {
    recipient.wrap_key(key, algorithm)
}

/// Recover a content key wrapped for `recipient`.
pub fn unwrap(
    wrapped: &str,
    recipient: &RecipientPrivateKey,
    algorithm: HashAlgorithm,
) -> Result<ContentKey> {
    recipient.unwrap_key(wrapped, algorithm)
}
