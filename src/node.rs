//! Entry and tuple value types, ordering, and the boundary predicate.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{ProllyError, Result};

/// Ordering key of an entry: timestamp first, ties broken by lexicographic
/// comparison of the hash bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tuple {
    pub timestamp: i64,
    pub hash: Vec<u8>,
}

impl Tuple {
    pub fn new(timestamp: i64, hash: Vec<u8>) -> Self {
        Tuple { timestamp, hash }
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuple({}, {})", self.timestamp, hex(&self.hash))
    }
}

/// A leaf payload. At levels above zero the `message` is the digest of the
/// child bucket the entry points to.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp: i64,
    pub hash: Vec<u8>,
    pub message: Vec<u8>,
}

impl Entry {
    pub fn new(timestamp: i64, hash: Vec<u8>, message: Vec<u8>) -> Self {
        Entry {
            timestamp,
            hash,
            message,
        }
    }

    pub fn tuple(&self) -> Tuple {
        Tuple {
            timestamp: self.timestamp,
            hash: self.hash.clone(),
        }
    }

    pub fn cmp_tuple(&self, other: &Tuple) -> Ordering {
        compare_tuples(self.timestamp, &self.hash, other.timestamp, &other.hash)
    }

    pub fn cmp_entry_tuple(&self, other: &Entry) -> Ordering {
        compare_tuples(self.timestamp, &self.hash, other.timestamp, &other.hash)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entry({}, {}, {})",
            self.timestamp,
            hex(&self.hash),
            hex(&self.message)
        )
    }
}

/// Total order over tuples: ascending timestamp, then hash bytes.
pub fn compare_tuples(a_ts: i64, a_hash: &[u8], b_ts: i64, b_hash: &[u8]) -> Ordering {
    a_ts.cmp(&b_ts).then_with(|| a_hash.cmp(b_hash))
}

/// Minimum hash length the boundary predicate can draw a 32-bit word from.
pub const MIN_HASH_LEN: usize = 4;

// Level salt; an odd constant so distinct levels decorrelate.
const LEVEL_SALT: u32 = 0x9e37_79b1;

/// Rejects entry hashes too short for the boundary predicate.
pub fn validate_entry_hash(hash: &[u8]) -> Result<()> {
    if hash.len() < MIN_HASH_LEN {
        return Err(ProllyError::BadInput(format!(
            "entry hash must be at least {MIN_HASH_LEN} bytes, got {}",
            hash.len()
        )));
    }
    Ok(())
}

/// Deterministic boundary predicate.
///
/// Interprets the first four hash bytes as a big-endian word, salts it with
/// the level, and declares a boundary when the result falls below
/// `u32::MAX / average`. Roughly one in `average` entries satisfies it.
/// The scheme is part of the wire format; changing it changes every tree
/// shape.
pub fn is_boundary(average: u32, level: u32, entry: &Entry) -> bool {
    debug_assert!(entry.hash.len() >= MIN_HASH_LEN);
    let mut word = [0u8; 4];
    for (slot, byte) in word.iter_mut().zip(entry.hash.iter()) {
        *slot = *byte;
    }
    let salted = u32::from_be_bytes(word) ^ level.wrapping_mul(LEVEL_SALT);
    salted < u32::MAX / average.max(1)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tuple_order_is_timestamp_then_hash() {
        let a = Tuple::new(1, vec![9, 9, 9, 9]);
        let b = Tuple::new(2, vec![0, 0, 0, 0]);
        assert!(a < b);

        let c = Tuple::new(2, vec![0, 0, 0, 1]);
        assert!(b < c);
    }

    #[test]
    fn zero_hash_is_boundary_at_level_zero() {
        let entry = Entry::new(0, vec![0, 0, 0, 0], b"hi".to_vec());
        assert!(is_boundary(30, 0, &entry));
    }

    #[test]
    fn level_salt_changes_outcome() {
        // With average 2 the threshold is half the word space; a word just
        // under the threshold flips once salted with a nonzero level.
        let entry = Entry::new(0, vec![0x7f, 0xff, 0xff, 0xfe], vec![]);
        assert!(is_boundary(2, 0, &entry));
        assert!(!is_boundary(2, 1, &entry));
    }

    #[test]
    fn short_hash_fails_validation() {
        assert!(validate_entry_hash(&[1, 2, 3]).is_err());
        assert!(validate_entry_hash(&[1, 2, 3, 4]).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn compare_tuples_is_total_and_antisymmetric(
            a_ts in any::<i64>(),
            a_hash in proptest::collection::vec(any::<u8>(), 4..8),
            b_ts in any::<i64>(),
            b_hash in proptest::collection::vec(any::<u8>(), 4..8),
        ) {
            let fwd = compare_tuples(a_ts, &a_hash, b_ts, &b_hash);
            let rev = compare_tuples(b_ts, &b_hash, a_ts, &a_hash);
            prop_assert_eq!(fwd, rev.reverse());
            if fwd == Ordering::Equal {
                prop_assert_eq!(a_ts, b_ts);
                prop_assert_eq!(a_hash, b_hash);
            }
        }

        #[test]
        fn boundary_rate_tracks_average(seed in any::<u32>()) {
            // Spread entries over the word space and check the hit rate is in
            // the right ballpark for average 16.
            let mut hits = 0u32;
            for i in 0..4096u32 {
                let word = seed.wrapping_add(i.wrapping_mul(0x0101_0101));
                let entry = Entry::new(0, word.to_be_bytes().to_vec(), vec![]);
                if is_boundary(16, 0, &entry) {
                    hits += 1;
                }
            }
            // Expectation is 256; the stride above cycles uniformly.
            prop_assert!(hits > 64, "too few boundaries: {hits}");
            prop_assert!(hits < 1024, "too many boundaries: {hits}");
        }
    }
}
