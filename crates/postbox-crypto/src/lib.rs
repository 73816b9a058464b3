//! # postbox-crypto
//!
//! Cryptographic primitives for postbox messaging.
//!
//! - **Envelope codec** (`stream`): streaming XChaCha20 with a single
//!   Poly1305 tag over the whole ciphertext
//! - **Key wrapping** (`wrap`): RSA-OAEP per recipient, RSA-PSS attestation
//!   signatures
//! - **Digests** (`digest`): SHA-2 family, selected per record by name
//!
//! ## Security
//!
//! Content keys use `zeroize` for memory cleanup and are compared in
//! constant time via `subtle`. Decoding never releases plaintext before the
//! tag has been verified.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digest;
pub mod error;
pub mod stream;
pub mod symmetric;
pub mod wrap;

#[cfg(test)]
mod proptests;

pub use digest::{unhex_fingerprint, HashAlgorithm};
pub use error::{CryptoError, Result};
pub use stream::{
    decode, decode_slice, encode, encode_to_vec, DecodedEnvelope, EnvelopeEncoder,
    EnvelopeHeader, PlaintextReader,
};
pub use symmetric::{ContentKey, Nonce, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use wrap::{unwrap, wrap, RecipientPrivateKey, RecipientPublicKey};
