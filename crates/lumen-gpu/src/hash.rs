//! Composable 64-bit content hashes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash a value with a fixed-key hasher, so equal values hash equally for the
/// lifetime of the process.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Fold an already computed hash into `seed`. Not commutative: the order of
/// combination is part of the result.
pub fn combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Hash `value` and fold it into `seed`.
pub fn combine_value<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    combine(seed, hash_value(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_deterministic() {
        assert_eq!(hash_value(&(1u32, 2u64)), hash_value(&(1u32, 2u64)));
        assert_ne!(hash_value(&1u32), hash_value(&2u32));
    }

    #[test]
    fn combination_depends_on_order() {
        let a = hash_value(&"a");
        let b = hash_value(&"b");
        assert_ne!(combine(combine(0, a), b), combine(combine(0, b), a));
        assert_eq!(combine_value(0, &"a"), combine(0, a));
    }
}
