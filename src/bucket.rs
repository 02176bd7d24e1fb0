//! In-memory bucket value: an immutable, content-addressed run of entries.

use std::fmt;
use std::sync::Arc;

use cid::Cid;

use crate::chunk;
use crate::codec;
use crate::common::TreeConfig;
use crate::error::Result;
use crate::node::Entry;

/// Shape parameters shared by every bucket of a tree; only `level` varies.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub average: u32,
    pub level: u32,
    pub codec: u64,
    pub hasher: u64,
}

impl Prefix {
    pub fn from_config(config: &TreeConfig, level: u32) -> Self {
        Prefix {
            average: config.average_bucket_size,
            level,
            codec: config.codec,
            hasher: config.hasher,
        }
    }

    /// Same tree parameters at a different level.
    pub fn at_level(&self, level: u32) -> Self {
        Prefix { level, ..*self }
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Prefix(avg={}, level={}, codec={:#x}, hasher={:#x})",
            self.average, self.level, self.codec, self.hasher
        )
    }
}

#[derive(Debug)]
struct BucketInner {
    prefix: Prefix,
    entries: Vec<Entry>,
    bytes: Vec<u8>,
    digest: Vec<u8>,
}

/// An ordered, possibly empty run of entries at a fixed level.
///
/// Immutable once built: the serialized bytes and digest are computed at
/// construction and shared on clone. Buckets reference children by digest,
/// never by pointer.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl Bucket {
    /// Builds a bucket from parts, computing its canonical bytes and digest.
    pub fn new(prefix: Prefix, entries: Vec<Entry>) -> Result<Self> {
        debug_assert!(
            entries
                .windows(2)
                .all(|w| w[0].cmp_entry_tuple(&w[1]).is_lt()),
            "bucket entries must be strictly ascending"
        );
        let bytes = codec::encode_bucket(&prefix, &entries)?;
        let digest = chunk::digest_for(prefix.hasher, &bytes)?;
        Ok(Bucket {
            inner: Arc::new(BucketInner {
                prefix,
                entries,
                bytes,
                digest,
            }),
        })
    }

    /// Assembles a bucket whose bytes and digest were already verified by the
    /// load path.
    pub(crate) fn from_verified_parts(
        prefix: Prefix,
        entries: Vec<Entry>,
        bytes: Vec<u8>,
        digest: Vec<u8>,
    ) -> Self {
        Bucket {
            inner: Arc::new(BucketInner {
                prefix,
                entries,
                bytes,
                digest,
            }),
        }
    }

    /// The canonical empty tree root: an empty bucket at level zero.
    pub fn empty(config: &TreeConfig) -> Result<Self> {
        Bucket::new(Prefix::from_config(config, 0), Vec::new())
    }

    pub fn prefix(&self) -> &Prefix {
        &self.inner.prefix
    }

    pub fn level(&self) -> u32 {
        self.inner.prefix.level
    }

    pub fn average(&self) -> u32 {
        self.inner.prefix.average
    }

    pub fn entries(&self) -> &[Entry] {
        &self.inner.entries
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    pub fn digest(&self) -> &[u8] {
        &self.inner.digest
    }

    pub fn cid(&self) -> Result<Cid> {
        chunk::cid_for(
            self.inner.prefix.codec,
            self.inner.prefix.hasher,
            &self.inner.digest,
        )
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// The last entry, which closed this bucket; `None` when empty.
    pub fn boundary(&self) -> Option<&Entry> {
        self.inner.entries.last()
    }

    /// The entry this bucket contributes one level up: boundary tuple plus
    /// this bucket's digest as the message.
    pub fn parent_entry(&self) -> Option<Entry> {
        self.boundary().map(|b| {
            Entry::new(b.timestamp, b.hash.clone(), self.inner.digest.clone())
        })
    }
}

impl PartialEq for Bucket {
    fn eq(&self, other: &Self) -> bool {
        self.inner.prefix == other.inner.prefix && self.inner.digest == other.inner.digest
    }
}

impl Eq for Bucket {}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = &self.inner.digest;
        let head = digest.iter().take(4).fold(String::new(), |mut acc, b| {
            acc.push_str(&format!("{b:02x}"));
            acc
        });
        write!(
            f,
            "Bucket(level={}, entries={}, digest={head}..)",
            self.level(),
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DAG_CBOR, SHA2_256};

    fn config() -> TreeConfig {
        TreeConfig::default()
    }

    #[test]
    fn empty_bucket_digest_is_stable() {
        let a = Bucket::empty(&config()).unwrap();
        let b = Bucket::empty(&config()).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a, b);
        assert!(a.boundary().is_none());
        assert!(a.parent_entry().is_none());
    }

    #[test]
    fn parent_entry_carries_boundary_tuple_and_digest() {
        let entries = vec![
            Entry::new(1, vec![0, 0, 0, 1], b"a".to_vec()),
            Entry::new(2, vec![0, 0, 0, 2], b"b".to_vec()),
        ];
        let bucket = Bucket::new(Prefix::from_config(&config(), 0), entries).unwrap();
        let parent = bucket.parent_entry().unwrap();
        assert_eq!(parent.timestamp, 2);
        assert_eq!(parent.hash, vec![0, 0, 0, 2]);
        assert_eq!(parent.message, bucket.digest());
    }

    #[test]
    fn cid_reflects_prefix_codes() {
        let bucket = Bucket::empty(&config()).unwrap();
        let cid = bucket.cid().unwrap();
        assert_eq!(cid.codec(), DAG_CBOR);
        assert_eq!(cid.hash().code(), SHA2_256);
    }

    #[test]
    fn equal_content_means_equal_bucket() {
        let entries = vec![Entry::new(5, vec![1, 2, 3, 4], b"m".to_vec())];
        let p = Prefix::from_config(&config(), 0);
        let a = Bucket::new(p, entries.clone()).unwrap();
        let b = Bucket::new(p, entries).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.bytes(), b.bytes());
    }
}
