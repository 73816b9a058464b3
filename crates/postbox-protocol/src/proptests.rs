//! Property-based tests for attestations and delivery tracking.

use proptest::prelude::*;

use postbox_crypto::HashAlgorithm;

use crate::{Attestation, DeliveryTracker, ReceiptState};

fn fingerprint() -> impl Strategy<Value = String> {
    prop::collection::vec(any::<u8>(), 1..16).prop_map(hex::encode)
}

proptest! {
    /// The attestation does not depend on key order.
    #[test]
    fn attestation_permutation_invariant(
        fingerprints in prop::collection::vec(fingerprint(), 1..8),
        seed in any::<u64>(),
    ) {
        let mut shuffled = fingerprints.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();

        let a = Attestation::compute(HashAlgorithm::Sha512, &fingerprints).unwrap();
        let b = Attestation::compute(HashAlgorithm::Sha512, &shuffled).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Adding a new fingerprint changes the attestation.
    #[test]
    fn attestation_changes_with_key_set(
        fingerprints in prop::collection::btree_set(fingerprint(), 1..8),
        extra in fingerprint(),
    ) {
        prop_assume!(!fingerprints.contains(&extra));
        let before = Attestation::compute(HashAlgorithm::Sha256, &fingerprints).unwrap();
        let mut grown = fingerprints.clone();
        grown.insert(extra);
        let after = Attestation::compute(HashAlgorithm::Sha256, &grown).unwrap();
        prop_assert_ne!(before, after);
    }

    /// Receipts never revert and the echo never counts as retrieval.
    #[test]
    fn tracker_monotonic(
        keyhashes in prop::collection::btree_set(fingerprint(), 1..10),
        marks in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let keyhashes: Vec<String> = keyhashes.into_iter().collect();
        let echo = keyhashes[0].clone();
        let mut tracker = DeliveryTracker::new(keyhashes.clone(), Some(&echo));
        prop_assert!(!tracker.was_retrieved());

        let mut marked = std::collections::BTreeSet::new();
        for index in marks {
            let keyhash = index.get(&keyhashes);
            tracker.mark_received(keyhash).unwrap();
            marked.insert(keyhash.clone());
            for done in &marked {
                prop_assert_eq!(tracker.state(done), Some(ReceiptState::Received));
            }
        }
        prop_assert_eq!(tracker.was_retrieved(), marked.iter().any(|k| *k != echo));
    }
}
