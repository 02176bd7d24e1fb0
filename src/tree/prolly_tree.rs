use std::sync::Arc;

use cid::Cid;
use log::debug;

use crate::bucket::Bucket;
use crate::chunk;
use crate::codec;
use crate::common::TreeConfig;
use crate::diff::{diff_trees, ProllyTreeDiff, TreeDiff};
use crate::error::{ProllyError, Result};
use crate::node::{Entry, Tuple};
use crate::store::BlockStore;
use crate::tree::cursor::Cursor;
use crate::tree::io;
use crate::tree::modification::{Mutation, Update};

/// Outcome of a point lookup: the entry, or the requested tuple echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    Found(Entry),
    Missing(Tuple),
}

/// A prolly tree: a single root bucket over an injected block store.
///
/// The tree owns only the root reference; every bucket lives in the store
/// under its CID. `clone` produces an independent root slot over the same
/// bucket, so two handles can diverge from a common state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProllyTree {
    root: Bucket,
}

impl ProllyTree {
    /// The canonical empty tree: one empty bucket at level zero.
    pub fn empty(config: &TreeConfig) -> Result<Self> {
        config.validate()?;
        Ok(ProllyTree {
            root: Bucket::empty(config)?,
        })
    }

    /// Re-opens a tree from a persisted root CID, verifying the fetched
    /// bucket against both the CID and the expected configuration.
    pub async fn load<S: BlockStore>(
        store: &S,
        cid: &Cid,
        config: &TreeConfig,
    ) -> Result<Self> {
        config.validate()?;
        if cid.codec() != config.codec || cid.hash().code() != config.hasher {
            return Err(ProllyError::InvalidCid(format!(
                "cid codes {:#x}/{:#x} do not match the tree configuration",
                cid.codec(),
                cid.hash().code()
            )));
        }
        let bytes = store.get(cid).await?.ok_or(ProllyError::NotFound(*cid))?;
        let (prefix, entries) = codec::decode_bucket(&bytes)?;
        if prefix.average != config.average_bucket_size
            || prefix.codec != config.codec
            || prefix.hasher != config.hasher
        {
            return Err(ProllyError::PrefixMismatch(format!(
                "root prefix {prefix:?} does not match the tree configuration"
            )));
        }
        let digest = chunk::digest_for(config.hasher, &bytes)?;
        if digest != cid.hash().digest() {
            return Err(ProllyError::DigestMismatch { cid: *cid });
        }
        Ok(ProllyTree {
            root: Bucket::from_verified_parts(prefix, entries, bytes, digest),
        })
    }

    pub fn root(&self) -> &Bucket {
        &self.root
    }

    pub fn root_cid(&self) -> Result<Cid> {
        self.root.cid()
    }

    pub fn config(&self) -> TreeConfig {
        let prefix = self.root.prefix();
        TreeConfig {
            average_bucket_size: prefix.average,
            codec: prefix.codec,
            hasher: prefix.hasher,
        }
    }

    /// Writes the root bucket to the store. Mutations persist every bucket
    /// they build, so this is only needed for roots created in memory.
    pub async fn save<S: BlockStore>(&self, store: &S) -> Result<Cid> {
        io::store_bucket(store, &self.root).await
    }

    /// A cursor positioned at the start of the root bucket.
    pub fn cursor<S: BlockStore>(&self, store: Arc<S>) -> Cursor<S> {
        Cursor::new(store, self.root.clone())
    }

    /// Batch point lookup. `tuples` must be strictly ascending; one forward
    /// cursor pass resolves all of them.
    pub async fn search<S: BlockStore>(
        &self,
        store: Arc<S>,
        tuples: Vec<Tuple>,
    ) -> Result<Vec<SearchResult>> {
        for pair in tuples.windows(2) {
            if pair[0] >= pair[1] {
                return Err(ProllyError::BadInput(
                    "search tuples must be strictly ascending".to_string(),
                ));
            }
        }

        let cursor = self.cursor(store);
        let mut results = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if cursor.done() {
                results.push(SearchResult::Missing(tuple));
                continue;
            }
            cursor.next_tuple(&tuple, Some(0)).await?;
            match cursor.current() {
                Ok(entry) if entry.cmp_tuple(&tuple).is_eq() => {
                    results.push(SearchResult::Found(entry));
                }
                _ => results.push(SearchResult::Missing(tuple)),
            }
        }
        Ok(results)
    }

    /// Starts a streaming mutation session against this tree's root. The
    /// tree itself is untouched; commit the session's root when done.
    pub fn mutation<S: BlockStore>(
        &self,
        store: Arc<S>,
        updates: Vec<Update>,
    ) -> Result<Mutation<S>> {
        Mutation::new(store, self.root.clone(), updates)
    }

    /// Applies ordered updates, committing the new root only after the whole
    /// session succeeds. Returns the collected diff segments.
    pub async fn mutate<S: BlockStore>(
        &mut self,
        store: Arc<S>,
        updates: Vec<Update>,
    ) -> Result<Vec<ProllyTreeDiff>> {
        let mut session = self.mutation(store, updates)?;
        let mut segments = Vec::new();
        while let Some(segment) = session.next().await? {
            segments.push(segment);
        }
        let root = session.new_root().cloned().ok_or(ProllyError::NoNewRoot)?;
        debug!("mutation committed new root {root:?}");
        self.root = root;
        Ok(segments)
    }

    /// Insert-or-replace entries, strictly ascending by tuple.
    pub async fn insert<S: BlockStore>(
        &mut self,
        store: Arc<S>,
        entries: Vec<Entry>,
    ) -> Result<Vec<ProllyTreeDiff>> {
        let updates = entries.into_iter().map(Update::Add).collect();
        self.mutate(store, updates).await
    }

    /// Remove entries by tuple, strictly ascending.
    pub async fn remove<S: BlockStore>(
        &mut self,
        store: Arc<S>,
        tuples: Vec<Tuple>,
    ) -> Result<Vec<ProllyTreeDiff>> {
        let updates = tuples.into_iter().map(Update::Rm).collect();
        self.mutate(store, updates).await
    }

    /// Streaming structural diff against another tree.
    pub async fn differ<L: BlockStore, R: BlockStore>(
        &self,
        store: Arc<L>,
        other_store: Arc<R>,
        other: &ProllyTree,
    ) -> Result<TreeDiff<L, R>> {
        TreeDiff::new(store, other_store, self.root.clone(), other.root.clone()).await
    }

    /// Collected structural diff against another tree.
    pub async fn diff<L: BlockStore, R: BlockStore>(
        &self,
        store: &Arc<L>,
        other_store: &Arc<R>,
        other: &ProllyTree,
    ) -> Result<Vec<ProllyTreeDiff>> {
        diff_trees(store, other_store, &self.root, other.root()).await
    }

    /// Union merge: entries present in `other` and absent here are inserted.
    /// Entries present on both sides keep this tree's message.
    pub async fn merge<L: BlockStore, R: BlockStore>(
        &mut self,
        store: Arc<L>,
        other_store: Arc<R>,
        other: &ProllyTree,
    ) -> Result<Vec<ProllyTreeDiff>> {
        let segments = self.diff(&store, &other_store, other).await?;
        let additions: Vec<Update> = segments
            .into_iter()
            .flat_map(|segment| segment.nodes)
            .filter_map(|(left, right)| match (left, right) {
                (None, Some(entry)) => Some(Update::Add(entry)),
                _ => None,
            })
            .collect();
        if additions.is_empty() {
            return Ok(Vec::new());
        }
        self.mutate(store, additions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;

    fn entry(ts: i64, msg: &[u8]) -> Entry {
        Entry::new(ts, vec![0xf0, 0, 0, ts as u8], msg.to_vec())
    }

    #[tokio::test]
    async fn empty_tree_misses_everything() {
        let store = Arc::new(MemoryBlockStore::new());
        let tree = ProllyTree::empty(&TreeConfig::default()).unwrap();

        let tuple = Tuple::new(7, vec![1, 2, 3, 4]);
        let results = tree.search(store, vec![tuple.clone()]).await.unwrap();
        assert_eq!(results, vec![SearchResult::Missing(tuple)]);
    }

    #[tokio::test]
    async fn insert_then_search_finds_entries() {
        let store = Arc::new(MemoryBlockStore::new());
        let mut tree = ProllyTree::empty(&TreeConfig::default()).unwrap();

        let entries = vec![entry(1, b"a"), entry(2, b"b"), entry(3, b"c")];
        tree.insert(Arc::clone(&store), entries.clone()).await.unwrap();

        let results = tree
            .search(
                Arc::clone(&store),
                vec![entries[0].tuple(), Tuple::new(2, vec![0xde, 0xad, 0xbe, 0xef]), entries[2].tuple()],
            )
            .await
            .unwrap();
        assert_eq!(results[0], SearchResult::Found(entries[0].clone()));
        assert!(matches!(results[1], SearchResult::Missing(_)));
        assert_eq!(results[2], SearchResult::Found(entries[2].clone()));
    }

    #[tokio::test]
    async fn search_rejects_unordered_tuples() {
        let store = Arc::new(MemoryBlockStore::new());
        let tree = ProllyTree::empty(&TreeConfig::default()).unwrap();
        let err = tree
            .search(
                store,
                vec![Tuple::new(2, vec![0; 4]), Tuple::new(1, vec![0; 4])],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProllyError::BadInput(_)));
    }

    #[tokio::test]
    async fn clone_diverges_independently() {
        let store = Arc::new(MemoryBlockStore::new());
        let mut tree = ProllyTree::empty(&TreeConfig::default()).unwrap();
        tree.insert(Arc::clone(&store), vec![entry(1, b"a")]).await.unwrap();

        let snapshot = tree.clone();
        tree.insert(Arc::clone(&store), vec![entry(2, b"b")]).await.unwrap();

        assert_ne!(snapshot.root().digest(), tree.root().digest());
        let results = snapshot
            .search(store, vec![entry(2, b"b").tuple()])
            .await
            .unwrap();
        assert!(matches!(results[0], SearchResult::Missing(_)));
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = Arc::new(MemoryBlockStore::new());
        let config = TreeConfig::default();
        let mut tree = ProllyTree::empty(&config).unwrap();
        tree.insert(Arc::clone(&store), vec![entry(1, b"a"), entry(2, b"b")])
            .await
            .unwrap();

        let cid = tree.save(store.as_ref()).await.unwrap();
        let loaded = ProllyTree::load(store.as_ref(), &cid, &config).await.unwrap();
        assert_eq!(loaded, tree);
    }

    #[tokio::test]
    async fn load_rejects_mismatched_config() {
        let store = Arc::new(MemoryBlockStore::new());
        let config = TreeConfig::default();
        let tree = ProllyTree::empty(&config).unwrap();
        let cid = tree.save(store.as_ref()).await.unwrap();

        let other = TreeConfig::new(12, config.codec, config.hasher).unwrap();
        let err = ProllyTree::load(store.as_ref(), &cid, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, ProllyError::PrefixMismatch(_)));
    }

    #[tokio::test]
    async fn merge_takes_the_union() {
        let store = Arc::new(MemoryBlockStore::new());
        let mut left = ProllyTree::empty(&TreeConfig::default()).unwrap();
        let mut right = ProllyTree::empty(&TreeConfig::default()).unwrap();

        left.insert(Arc::clone(&store), vec![entry(1, b"a"), entry(2, b"left")])
            .await
            .unwrap();
        right
            .insert(Arc::clone(&store), vec![entry(2, b"right"), entry(3, b"c")])
            .await
            .unwrap();

        left.merge(Arc::clone(&store), Arc::clone(&store), &right)
            .await
            .unwrap();

        let results = left
            .search(
                store,
                vec![
                    entry(1, b"a").tuple(),
                    entry(2, b"left").tuple(),
                    entry(3, b"c").tuple(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(results[0], SearchResult::Found(entry(1, b"a")));
        // Shared tuple keeps the local message.
        assert_eq!(results[1], SearchResult::Found(entry(2, b"left")));
        assert_eq!(results[2], SearchResult::Found(entry(3, b"c")));
    }
}
