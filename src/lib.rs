//! # prolly-index
//!
//! A probabilistic, content-addressed search tree (prolly tree): an ordered
//! key/value index whose shape is a deterministic function of its contents.
//! Identical content produces identical buckets and an identical root digest
//! regardless of insertion order, which makes two trees cheaply diffable and
//! mergeable by skipping subtrees whose digests match.
//!
//! The crate provides:
//! - **Entries and boundaries**: ordered `(timestamp, hash, message)` leaf
//!   entries and the level-salted boundary predicate that chunks them.
//! - **Buckets**: immutable, canonically encoded bucket values addressed by
//!   CID in an injected [`store::BlockStore`].
//! - **Cursor**: a multi-level positioned traversal with lazy bucket loading.
//! - **Mutation engine**: bottom-up rebuild applying ordered inserts and
//!   removals, streaming diffs as it goes.
//! - **Diff engine**: lockstep structural diff of two trees with
//!   equal-subtree skipping.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prolly_index::{Entry, MemoryBlockStore, ProllyTree, TreeConfig};
//!
//! let store = Arc::new(MemoryBlockStore::new());
//! let mut tree = ProllyTree::empty(&TreeConfig::default())?;
//! tree.insert(Arc::clone(&store), vec![Entry::new(0, vec![0, 0, 0, 0], b"hi".to_vec())]).await?;
//! let cid = tree.save(store.as_ref()).await?;
//! ```

pub mod bucket;
pub mod chunk;
pub mod codec;
pub mod common;
pub mod diff;
pub mod error;
pub mod node;
pub mod store;
pub mod tree;

pub use bucket::{Bucket, Prefix};
pub use common::TreeConfig;
pub use diff::{diff_trees, ProllyTreeDiff, TreeDiff};
pub use error::{ProllyError, Result};
pub use node::{compare_tuples, is_boundary, Entry, Tuple};
pub use store::{BlockStore, MemoryBlockStore};
pub use tree::{Cursor, Mutation, ProllyTree, SearchResult, Update};
