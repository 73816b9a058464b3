//! Property-based tests for the envelope codec.
//!
//! These cover the roundtrip property for arbitrary plaintexts and read
//! patterns, and tamper detection for every position of the ciphertext.

use std::io::Read;

use proptest::prelude::*;

use crate::stream::PREFIX_SIZE;
use crate::{decode_slice, encode, encode_to_vec, CryptoError, EnvelopeHeader};

proptest! {
    /// Decoding an encoded envelope returns the original plaintext.
    #[test]
    fn encode_decode_roundtrip(plaintext in prop::collection::vec(any::<u8>(), 0..4096)) {
        let (key, envelope) = encode_to_vec(&plaintext, &EnvelopeHeader::default()).unwrap();
        let (header, decoded) = decode_slice(&envelope, &key).unwrap();
        prop_assert_eq!(decoded, plaintext);
        prop_assert_eq!(header.get("Type"), Some("message"));
    }

    /// The envelope does not depend on how the consumer sizes its reads.
    #[test]
    fn read_size_does_not_change_output(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        step in 1usize..700,
    ) {
        let (key, mut encoder) = encode(plaintext.as_slice(), &EnvelopeHeader::default()).unwrap();
        let mut envelope = Vec::new();
        let mut buf = vec![0u8; step];
        loop {
            let n = encoder.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            envelope.extend_from_slice(&buf[..n]);
        }
        let (_, decoded) = decode_slice(&envelope, &key).unwrap();
        prop_assert_eq!(decoded, plaintext);
    }

    /// Flipping any single byte after the separator breaks the tag.
    #[test]
    fn flipped_byte_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..1024),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let (key, mut envelope) = encode_to_vec(&plaintext, &EnvelopeHeader::default()).unwrap();
        let idx = PREFIX_SIZE + position.index(envelope.len() - PREFIX_SIZE);
        envelope[idx] ^= mask;
        prop_assert!(matches!(decode_slice(&envelope, &key), Err(CryptoError::Integrity)));
    }
}
