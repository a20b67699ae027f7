//! Deterministic percentage splitter used by rollouts.
//!
//! The key is hashed as raw UTF-8 bytes; the first four MD5 bytes are read
//! as a little-endian signed 32-bit integer and reduced to a fraction in
//! `[0, 1)`. This mapping is a stable, observable contract and must not
//! change.
use md5;

/// Map a key to its bucket position in `[0, 1)`.
pub fn percentage_of_key(key: &str) -> f64 {
    let hash = md5::compute(key.as_bytes());
    let num = i32::from_le_bytes(hash[0..4].try_into().unwrap()) as f64;
    (num / i32::MIN as f64).abs()
}

/// Return `true` if `key` hashes into the `[lo, hi]` rollout interval.
/// The full `[0, 1]` interval always matches without hashing.
pub fn key_belongs_to_percentage(key: &str, range: &[f64]) -> bool {
    if range.len() != 2 {
        return false;
    }
    if range[0] == 0.0 && range[1] == 1.0 {
        return true;
    }
    let percentage = percentage_of_key(key);
    percentage >= range[0] && percentage <= range[1]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn percentage_is_deterministic() {
        let p1 = percentage_of_key("flag-akey-1");
        let p2 = percentage_of_key("flag-akey-1");
        assert_eq!(p1, p2);
    }

    #[test]
    fn different_keys_spread() {
        let p1 = percentage_of_key("flag-akey-1");
        let p2 = percentage_of_key("flag-akey-2");
        assert_ne!(p1, p2);
    }

    #[test]
    fn full_range_always_matches() {
        assert!(key_belongs_to_percentage("anything", &[0.0, 1.0]));
    }

    #[test]
    fn malformed_range_never_matches() {
        assert!(!key_belongs_to_percentage("anything", &[0.5]));
        assert!(!key_belongs_to_percentage("anything", &[]));
    }

    proptest! {
        #[test]
        fn percentage_is_within_unit_interval(key in ".*") {
            let p = percentage_of_key(&key);
            prop_assert!((0.0..=1.0).contains(&p));
        }

        #[test]
        fn disjoint_halves_partition(key in "[a-z0-9]{1,32}") {
            let low = key_belongs_to_percentage(&key, &[0.0, 0.5]);
            let high = key_belongs_to_percentage(&key, &[0.5, 1.0]);
            // Boundary values may land in both halves; never in neither.
            prop_assert!(low || high);
        }
    }
}
