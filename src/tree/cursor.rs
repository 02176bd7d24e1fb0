//! Multi-level cursor over a prolly tree.
//!
//! A cursor is a stack of buckets from the root down to the current level
//! plus an index into the topmost bucket. Sideways movement loads sibling
//! buckets lazily; vertical movement is steered by a guide that picks the
//! entry index at each level.
//!
//! Mutating operations take an in-memory lock, work on a cloned snapshot of
//! the state, and commit it only on success. Dropping a suspended operation
//! releases the lock and leaves the cursor where it was, so cancellation
//! mid-fetch cannot corrupt the position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::bucket::Bucket;
use crate::error::{ProllyError, Result};
use crate::node::{Entry, Tuple};
use crate::store::BlockStore;
use crate::tree::io;

/// Picks an entry index during vertical motion.
#[derive(Debug, Clone)]
enum Guide {
    /// Index 0; used when descending the leftmost path.
    Lowest,
    /// Index of the first entry with tuple >= the target; last index if none.
    AtTuple(Tuple),
}

impl Guide {
    fn apply(&self, entries: &[Entry]) -> isize {
        match self {
            Guide::Lowest => {
                if entries.is_empty() {
                    -1
                } else {
                    0
                }
            }
            Guide::AtTuple(tuple) => {
                match entries.iter().position(|e| e.cmp_tuple(tuple).is_ge()) {
                    Some(i) => i as isize,
                    None => entries.len() as isize - 1,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CursorState {
    /// Root at index 0, current bucket last. Never empty.
    buckets: Vec<Bucket>,
    /// Index into the current bucket; -1 iff the current bucket is empty.
    index: isize,
    done: bool,
}

impl CursorState {
    fn top(&self) -> &Bucket {
        self.buckets.last().unwrap()
    }

    fn level(&self) -> u32 {
        self.top().level()
    }

    fn root_level(&self) -> u32 {
        self.buckets[0].level()
    }

    fn would_overflow(&self) -> bool {
        self.index + 1 >= self.top().len() as isize
    }

    fn current(&self) -> Result<&Entry> {
        if self.index < 0 {
            return Err(ProllyError::CursorInvalidMove(
                "current bucket is empty".to_string(),
            ));
        }
        self.top()
            .entries()
            .get(self.index as usize)
            .ok_or_else(|| {
                ProllyError::CursorInvalidMove(format!(
                    "cursor index {} out of range",
                    self.index
                ))
            })
    }
}

/// Clears the busy flag when a mutating operation ends, even on cancel.
struct OpGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> OpGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(ProllyError::CursorLocked);
        }
        Ok(OpGuard { flag })
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A stateful position inside a tree.
#[derive(Debug)]
pub struct Cursor<S: BlockStore> {
    store: Arc<S>,
    state: Mutex<CursorState>,
    busy: AtomicBool,
}

impl<S: BlockStore> Clone for Cursor<S> {
    fn clone(&self) -> Self {
        Cursor {
            store: Arc::clone(&self.store),
            state: Mutex::new(self.state.lock().clone()),
            busy: AtomicBool::new(false),
        }
    }
}

impl<S: BlockStore> Cursor<S> {
    /// Creates a cursor positioned at the first entry of the root bucket.
    pub fn new(store: Arc<S>, root: Bucket) -> Self {
        let index = if root.is_empty() { -1 } else { 0 };
        Cursor {
            store,
            state: Mutex::new(CursorState {
                buckets: vec![root],
                index,
                done: false,
            }),
            busy: AtomicBool::new(false),
        }
    }

    pub fn level(&self) -> u32 {
        self.state.lock().level()
    }

    pub fn root_level(&self) -> u32 {
        self.state.lock().root_level()
    }

    /// Current index; -1 iff the current bucket is empty.
    pub fn index(&self) -> isize {
        self.state.lock().index
    }

    pub fn current(&self) -> Result<Entry> {
        self.state.lock().current().cloned()
    }

    /// Snapshot of the bucket stack, root first.
    pub fn buckets(&self) -> Vec<Bucket> {
        self.state.lock().buckets.clone()
    }

    pub fn current_bucket(&self) -> Bucket {
        self.state.lock().top().clone()
    }

    pub fn done(&self) -> bool {
        self.state.lock().done
    }

    pub fn locked(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// True iff the path from the root follows first-entry links all the way
    /// down: the cursor sits inside the leftmost bucket of its level.
    pub fn is_at_tail(&self) -> bool {
        path_is_edge(&self.state.lock().buckets, false)
    }

    /// True iff the path from the root follows last-entry links: the cursor
    /// sits inside the rightmost bucket of its level.
    pub fn is_at_head(&self) -> bool {
        path_is_edge(&self.state.lock().buckets, true)
    }

    /// Advances one tuple at `level` (current level when `None`).
    pub async fn next(&self, level: Option<u32>) -> Result<()> {
        let _guard = OpGuard::acquire(&self.busy)?;
        let mut snap = self.state.lock().clone();
        if snap.done {
            return Ok(());
        }
        let pre = snap.level();
        let target = level.unwrap_or(pre);
        if target > snap.root_level() {
            snap.done = true;
        } else {
            if target != snap.level() {
                let guide = default_guide(&snap, target)?;
                move_to_level(self.store.as_ref(), &mut snap, target, &guide).await?;
            }
            if target >= pre {
                move_sideways(self.store.as_ref(), &mut snap).await?;
            }
        }
        *self.state.lock() = snap;
        Ok(())
    }

    /// Advances to the first entry of the next bucket at `level`.
    pub async fn next_bucket(&self, level: Option<u32>) -> Result<()> {
        let _guard = OpGuard::acquire(&self.busy)?;
        let mut snap = self.state.lock().clone();
        if snap.done {
            return Ok(());
        }
        let target = level.unwrap_or(snap.level());
        if target > snap.root_level() {
            snap.done = true;
        } else {
            if target != snap.level() {
                let guide = default_guide(&snap, target)?;
                move_to_level(self.store.as_ref(), &mut snap, target, &guide).await?;
            }
            snap.index = snap.top().len() as isize - 1;
            move_sideways(self.store.as_ref(), &mut snap).await?;
        }
        *self.state.lock() = snap;
        Ok(())
    }

    /// Fast-forwards at `level` until the current tuple is >= `tuple`.
    /// Only ever moves forward; a tuple at or before the current position
    /// leaves the cursor where it is.
    pub async fn next_tuple(&self, tuple: &Tuple, level: Option<u32>) -> Result<()> {
        let _guard = OpGuard::acquire(&self.busy)?;
        let mut snap = self.state.lock().clone();
        if snap.done {
            return Ok(());
        }
        let target = level.unwrap_or(snap.level());
        if target > snap.root_level() {
            snap.done = true;
            *self.state.lock() = snap;
            return Ok(());
        }
        if target > snap.level() {
            let guide = default_guide(&snap, target)?;
            move_to_level(self.store.as_ref(), &mut snap, target, &guide).await?;
        }

        // Climb while this bucket cannot contain the tuple.
        while snap.level() < snap.root_level() {
            match snap.top().boundary() {
                Some(boundary) if boundary.cmp_tuple(tuple).is_lt() => {
                    let up = snap.level() + 1;
                    let guide = Guide::AtTuple(snap.current()?.tuple());
                    move_to_level(self.store.as_ref(), &mut snap, up, &guide).await?;
                }
                _ => break,
            }
        }

        let guided = Guide::AtTuple(tuple.clone()).apply(snap.top().entries());
        snap.index = snap.index.max(guided);

        if target < snap.level() {
            move_to_level(
                self.store.as_ref(),
                &mut snap,
                target,
                &Guide::AtTuple(tuple.clone()),
            )
            .await?;
        }
        *self.state.lock() = snap;
        Ok(())
    }

    /// Resets to the root and descends to `level` aimed at `tuple`. Unlike
    /// `next_tuple` this may move backwards.
    pub async fn jump_to(&self, tuple: &Tuple, level: u32) -> Result<()> {
        let _guard = OpGuard::acquire(&self.busy)?;
        let mut snap = self.state.lock().clone();
        if snap.done {
            return Ok(());
        }
        if level > snap.root_level() {
            return Err(ProllyError::CursorInvalidMove(format!(
                "cannot jump to level {level} above the root level {}",
                snap.root_level()
            )));
        }
        snap.buckets.truncate(1);
        snap.index = Guide::AtTuple(tuple.clone()).apply(snap.buckets[0].entries());
        if level < snap.level() {
            move_to_level(
                self.store.as_ref(),
                &mut snap,
                level,
                &Guide::AtTuple(tuple.clone()),
            )
            .await?;
        }
        *self.state.lock() = snap;
        Ok(())
    }
}

fn path_is_edge(buckets: &[Bucket], last: bool) -> bool {
    buckets.windows(2).all(|pair| {
        let link = if last {
            pair[0].entries().last()
        } else {
            pair[0].entries().first()
        };
        match link {
            Some(entry) => entry.message == pair[1].digest(),
            None => false,
        }
    })
}

fn default_guide(state: &CursorState, target: u32) -> Result<Guide> {
    if target < state.level() {
        Ok(Guide::Lowest)
    } else {
        Ok(Guide::AtTuple(state.current()?.tuple()))
    }
}

async fn move_to_level<S: BlockStore>(
    store: &S,
    state: &mut CursorState,
    target: u32,
    guide: &Guide,
) -> Result<()> {
    if target == state.level() {
        return Err(ProllyError::CursorInvalidMove(format!(
            "already at level {target}"
        )));
    }
    if target > state.root_level() {
        return Err(ProllyError::CursorInvalidMove(format!(
            "level {target} is above the root level {}",
            state.root_level()
        )));
    }
    while state.level() != target {
        if target > state.level() {
            state.buckets.pop();
            state.index = guide.apply(state.top().entries());
        } else {
            let entry = state.current()?.clone();
            let child_prefix = state.top().prefix().at_level(state.level() - 1);
            let child = io::load_bucket(store, &entry.message, &child_prefix).await?;
            if child.is_empty() {
                return Err(ProllyError::MalformedTree(format!(
                    "entry at level {} links to an empty bucket",
                    state.level()
                )));
            }
            state.buckets.push(child);
            state.index = guide.apply(state.top().entries());
        }
    }
    Ok(())
}

/// Steps to the next entry at the current level, climbing over bucket ends
/// and descending back down the leftmost path of the next sibling.
async fn move_sideways<S: BlockStore>(store: &S, state: &mut CursorState) -> Result<()> {
    let original = state.level();
    while state.would_overflow() {
        if state.buckets.len() == 1 {
            trace!("cursor ran off the head of level {original}");
            state.done = true;
            return Ok(());
        }
        let guide = Guide::AtTuple(state.current()?.tuple());
        state.buckets.pop();
        state.index = guide.apply(state.top().entries());
    }
    state.index += 1;
    if state.level() != original {
        move_to_level(store, state, original, &Guide::Lowest).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Prefix;
    use crate::common::TreeConfig;
    use crate::store::MemoryBlockStore;
    use crate::tree::io::store_bucket;

    // Hashes beginning with 0x00 fire the level-0 boundary predicate at
    // average 30; hashes beginning with 0xf0 do not.
    fn boundary_hash(n: u8) -> Vec<u8> {
        vec![0, 0, 0, n]
    }

    fn plain_hash(n: u8) -> Vec<u8> {
        vec![0xf0, 0, 0, n]
    }

    async fn two_level_tree(store: &MemoryBlockStore) -> (Bucket, Vec<Entry>) {
        let config = TreeConfig::default();
        let p0 = Prefix::from_config(&config, 0);

        let e1 = Entry::new(1, plain_hash(1), b"m1".to_vec());
        let e2 = Entry::new(2, boundary_hash(2), b"m2".to_vec());
        let e3 = Entry::new(3, plain_hash(3), b"m3".to_vec());
        let e4 = Entry::new(4, boundary_hash(4), b"m4".to_vec());
        let e5 = Entry::new(5, plain_hash(5), b"m5".to_vec());

        let leaf1 = Bucket::new(p0, vec![e1.clone(), e2.clone()]).unwrap();
        let leaf2 = Bucket::new(p0, vec![e3.clone(), e4.clone()]).unwrap();
        let leaf3 = Bucket::new(p0, vec![e5.clone()]).unwrap();

        let root = Bucket::new(
            p0.at_level(1),
            vec![
                leaf1.parent_entry().unwrap(),
                leaf2.parent_entry().unwrap(),
                leaf3.parent_entry().unwrap(),
            ],
        )
        .unwrap();

        for bucket in [&leaf1, &leaf2, &leaf3, &root] {
            store_bucket(store, bucket).await.unwrap();
        }
        (root, vec![e1, e2, e3, e4, e5])
    }

    #[tokio::test]
    async fn walks_all_leaf_entries_in_order() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.next(Some(0)).await.unwrap();
        let mut seen = vec![cursor.current().unwrap()];
        loop {
            cursor.next(None).await.unwrap();
            if cursor.done() {
                break;
            }
            seen.push(cursor.current().unwrap());
        }
        assert_eq!(seen, entries);
    }

    #[tokio::test]
    async fn next_bucket_lands_on_first_entry() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.next(Some(0)).await.unwrap();
        cursor.next_bucket(None).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[2]);
        assert_eq!(cursor.index(), 0);

        cursor.next_bucket(None).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[4]);

        cursor.next_bucket(None).await.unwrap();
        assert!(cursor.done());
    }

    #[tokio::test]
    async fn jump_to_targets_first_entry_at_or_after_tuple() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.jump_to(&entries[2].tuple(), 0).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[2]);

        // Jumping backwards is allowed.
        cursor.jump_to(&entries[0].tuple(), 0).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[0]);

        // Above the root is not.
        let err = cursor.jump_to(&entries[0].tuple(), 7).await.unwrap_err();
        assert!(matches!(err, ProllyError::CursorInvalidMove(_)));
    }

    #[tokio::test]
    async fn next_tuple_fast_forwards_across_buckets() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.next_tuple(&entries[0].tuple(), Some(0)).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[0]);

        cursor.next_tuple(&entries[3].tuple(), Some(0)).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[3]);

        cursor.next_tuple(&entries[4].tuple(), Some(0)).await.unwrap();
        assert_eq!(cursor.current().unwrap(), entries[4]);
        assert!(!cursor.done());
    }

    #[tokio::test]
    async fn head_and_tail_detection() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.next(Some(0)).await.unwrap();
        assert!(cursor.is_at_tail());
        assert!(!cursor.is_at_head());

        cursor.next_tuple(&entries[4].tuple(), Some(0)).await.unwrap();
        assert!(cursor.is_at_head());
        assert!(!cursor.is_at_tail());
    }

    #[tokio::test]
    async fn done_is_sticky_and_above_root_moves_finish_the_cursor() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);

        cursor.next(Some(5)).await.unwrap();
        assert!(cursor.done());

        // No-ops from here on.
        cursor.next(Some(0)).await.unwrap();
        assert!(cursor.done());
        cursor.next_tuple(&entries[0].tuple(), Some(0)).await.unwrap();
        assert!(cursor.done());
    }

    #[tokio::test]
    async fn empty_root_reports_index_minus_one() {
        let store = MemoryBlockStore::new();
        let root = Bucket::empty(&TreeConfig::default()).unwrap();
        store_bucket(&store, &root).await.unwrap();
        let cursor = Cursor::new(Arc::new(store), root);

        assert_eq!(cursor.index(), -1);
        assert!(cursor.current().is_err());
        assert!(cursor.is_at_tail());
        assert!(cursor.is_at_head());

        cursor.next(None).await.unwrap();
        assert!(cursor.done());
    }

    #[tokio::test]
    async fn clone_is_independent() {
        let store = MemoryBlockStore::new();
        let (root, entries) = two_level_tree(&store).await;
        let cursor = Cursor::new(Arc::new(store), root);
        cursor.next(Some(0)).await.unwrap();

        let fork = cursor.clone();
        cursor.next_bucket(None).await.unwrap();

        assert_eq!(fork.current().unwrap(), entries[0]);
        assert_eq!(cursor.current().unwrap(), entries[2]);
        assert!(!fork.locked());
    }
}
