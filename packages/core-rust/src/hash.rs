//! FNV-1a hash used to place messages on consistent-hash bindings.
//!
//! The hash runs over raw bytes so header values and routing keys hash the same
//! way regardless of where they came from.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash of `bytes`.
///
/// # Examples
///
/// ```
/// use autobus_core::hash::fnv1a;
///
/// assert_eq!(fnv1a(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a(b""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Picks a slot for `key` from a list of weights.
///
/// Each slot owns `weight` consecutive points on a ring of `sum(weights)` points.
/// Returns `None` when every weight is zero.
#[must_use]
pub fn weighted_slot(key: &[u8], weights: &[u32]) -> Option<usize> {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return None;
    }
    let mut point = u64::from(fnv1a(key)) % total;
    for (index, &weight) in weights.iter().enumerate() {
        let weight = u64::from(weight);
        if point < weight {
            return Some(index);
        }
        point -= weight;
    }
    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a(b"hello"), 1_335_831_723);
        assert_eq!(fnv1a(b"key1"), 927_623_783);
        assert_eq!(fnv1a(b""), 2_166_136_261);
    }

    #[test]
    fn fnv1a_case_sensitive() {
        assert_ne!(fnv1a(b"Hello"), fnv1a(b"hello"));
    }

    #[test]
    fn fnv1a_distribution_1000_unique() {
        let mut set = std::collections::HashSet::new();
        for i in 0..1000 {
            set.insert(fnv1a(format!("item-{i}").as_bytes()));
        }
        assert_eq!(set.len(), 1000);
    }

    #[test]
    fn weighted_slot_all_zero_is_none() {
        assert_eq!(weighted_slot(b"k", &[0, 0]), None);
        assert_eq!(weighted_slot(b"k", &[]), None);
    }

    #[test]
    fn weighted_slot_skips_zero_weights() {
        for i in 0..100 {
            let key = format!("order-{i}");
            assert_eq!(weighted_slot(key.as_bytes(), &[0, 3, 0]), Some(1));
        }
    }

    #[test]
    fn weighted_slot_spreads_keys() {
        let mut hits = [0_u32; 2];
        for i in 0..1000 {
            let key = format!("order-{i}");
            let slot = weighted_slot(key.as_bytes(), &[1, 1]).unwrap();
            hits[slot] += 1;
        }
        assert!(hits[0] > 300 && hits[1] > 300, "skewed: {hits:?}");
    }

    proptest! {
        #[test]
        fn weighted_slot_is_stable(key in prop::collection::vec(any::<u8>(), 0..32),
                                   weights in prop::collection::vec(1_u32..10, 1..6)) {
            let a = weighted_slot(&key, &weights);
            let b = weighted_slot(&key, &weights);
            prop_assert_eq!(a, b);
            prop_assert!(a.unwrap() < weights.len());
        }
    }
}
