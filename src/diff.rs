//! Structural diff between two trees.
//!
//! Two cursors walk the leaf level in lockstep. Whenever both sides sit at
//! the start of content-identical buckets, the walk skips sideways at the
//! highest level whose bucket digests match, so shared subtrees cost one
//! comparison instead of a traversal. Differences stream out in ascending
//! tuple order as segments of node and bucket pairs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;

use crate::bucket::Bucket;
use crate::error::Result;
use crate::node::{Entry, Tuple};
use crate::store::BlockStore;
use crate::tree::cursor::Cursor;
use crate::tree::modification::cancel_equal_buckets;

/// One streamed segment of differences. Node pairs are `(left, right)`:
/// `(Some, None)` only on the left tree, `(None, Some)` only on the right,
/// `(Some, Some)` present on both with different messages. Bucket pairs
/// follow the same convention.
#[derive(Debug, Clone, Default)]
pub struct ProllyTreeDiff {
    pub nodes: Vec<(Option<Entry>, Option<Entry>)>,
    pub buckets: Vec<(Option<Bucket>, Option<Bucket>)>,
}

impl ProllyTreeDiff {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.buckets.is_empty()
    }
}

struct DiffSide<S: BlockStore> {
    cursor: Cursor<S>,
    buf: VecDeque<Entry>,
    /// Boundary tuple of the last consumed bucket; entries at or below it
    /// have all been seen.
    watermark: Option<Tuple>,
    exhausted: bool,
    /// Last digest seen per level, to record each bucket exactly once.
    seen: HashMap<u32, Vec<u8>>,
}

impl<S: BlockStore> DiffSide<S> {
    async fn new(store: Arc<S>, root: Bucket) -> Result<Self> {
        let cursor = Cursor::new(store, root);
        if cursor.root_level() > 0 {
            // Descend the leftmost path to the leaf level.
            cursor.next(Some(0)).await?;
        }
        Ok(DiffSide {
            cursor,
            buf: VecDeque::new(),
            watermark: None,
            exhausted: false,
            seen: HashMap::new(),
        })
    }

    /// Records a bucket as visited; true when it was not seen before.
    fn mark(&mut self, bucket: &Bucket) -> bool {
        let previous = self.seen.insert(bucket.level(), bucket.digest().to_vec());
        previous.as_deref() != Some(bucket.digest())
    }
}

/// A streaming diff session; pull segments with [`TreeDiff::next`].
pub struct TreeDiff<L: BlockStore, R: BlockStore> {
    left: DiffSide<L>,
    right: DiffSide<R>,
    pending_nodes: Vec<(Option<Entry>, Option<Entry>)>,
    pending_buckets: Vec<(Option<Bucket>, Option<Bucket>)>,
    done: bool,
}

enum Cut {
    Nothing,
    UpTo(Tuple),
    All,
}

impl<L: BlockStore, R: BlockStore> TreeDiff<L, R> {
    pub async fn new(
        store_left: Arc<L>,
        store_right: Arc<R>,
        left_root: Bucket,
        right_root: Bucket,
    ) -> Result<Self> {
        Ok(TreeDiff {
            left: DiffSide::new(store_left, left_root).await?,
            right: DiffSide::new(store_right, right_root).await?,
            pending_nodes: Vec::new(),
            pending_buckets: Vec::new(),
            done: false,
        })
    }

    /// Produces the next diff segment, or `None` when both trees are spent.
    pub async fn next(&mut self) -> Result<Option<ProllyTreeDiff>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.spent() {
                self.drain_nodes();
                self.done = true;
                return Ok(self.take_segment());
            }

            self.step().await?;
            self.drain_nodes();

            let settled = self.left.exhausted
                || self.right.exhausted
                || (self.left.buf.is_empty()
                    && self.right.buf.is_empty()
                    && self.left.watermark == self.right.watermark);
            let flush = !self.pending_nodes.is_empty()
                || (settled && !self.pending_buckets.is_empty());
            if flush {
                if let Some(segment) = self.take_segment() {
                    return Ok(Some(segment));
                }
            }
        }
    }

    fn spent(&self) -> bool {
        self.left.exhausted
            && self.right.exhausted
            && self.left.buf.is_empty()
            && self.right.buf.is_empty()
    }

    async fn step(&mut self) -> Result<()> {
        match (self.left.exhausted, self.right.exhausted) {
            (false, true) => {
                let news = pull(&mut self.left).await?;
                self.pend_left(news);
            }
            (true, false) => {
                let news = pull(&mut self.right).await?;
                self.pend_right(news);
            }
            (false, false) => {
                let aligned = self.left.buf.is_empty()
                    && self.right.buf.is_empty()
                    && self.left.watermark == self.right.watermark;
                if aligned {
                    let lb = self.left.cursor.current_bucket();
                    let rb = self.right.cursor.current_bucket();
                    if lb == rb {
                        self.skip_equal().await?;
                    } else {
                        let news = pull(&mut self.left).await?;
                        self.pend_left(news);
                        let news = pull(&mut self.right).await?;
                        self.pend_right(news);
                    }
                } else if self.left.watermark <= self.right.watermark {
                    let news = pull(&mut self.left).await?;
                    self.pend_left(news);
                } else {
                    let news = pull(&mut self.right).await?;
                    self.pend_right(news);
                }
            }
            (true, true) => {}
        }
        Ok(())
    }

    /// Both cursors sit at the start of content-identical buckets. Skip the
    /// shared span at the highest level whose bucket digests also match.
    async fn skip_equal(&mut self) -> Result<()> {
        let left_stack = self.left.cursor.buckets();
        let right_stack = self.right.cursor.buckets();

        let mut skip_level = 0u32;
        for lb in &left_stack {
            if lb.level() == 0 {
                continue;
            }
            let matched = right_stack
                .iter()
                .any(|rb| rb.level() == lb.level() && rb == lb);
            if matched && lb.level() > skip_level {
                skip_level = lb.level();
            }
        }
        trace!("skipping shared subtree at level {skip_level}");

        // Record every newly entered stack bucket: shared ones silently,
        // differing ancestors as pending diffs.
        let mut left_news = Vec::new();
        for lb in &left_stack {
            if lb.level() == 0 {
                continue;
            }
            let matched = right_stack
                .iter()
                .any(|rb| rb.level() == lb.level() && rb == lb);
            if self.left.mark(lb) && !matched {
                left_news.push(lb.clone());
            }
        }
        let mut right_news = Vec::new();
        for rb in &right_stack {
            if rb.level() == 0 {
                continue;
            }
            let matched = left_stack
                .iter()
                .any(|lb| lb.level() == rb.level() && lb == rb);
            if self.right.mark(rb) && !matched {
                right_news.push(rb.clone());
            }
        }
        self.pend_left(left_news);
        self.pend_right(right_news);

        let span_boundary = if skip_level == 0 {
            self.left.cursor.current_bucket().boundary().map(|e| e.tuple())
        } else {
            left_stack
                .iter()
                .find(|b| b.level() == skip_level)
                .and_then(|b| b.boundary())
                .map(|e| e.tuple())
        };

        // The shared leaf itself is consumed without diffs.
        let left_leaf = self.left.cursor.current_bucket();
        self.left.mark(&left_leaf);
        let right_leaf = self.right.cursor.current_bucket();
        self.right.mark(&right_leaf);

        advance_past(&mut self.left, skip_level).await?;
        advance_past(&mut self.right, skip_level).await?;
        self.left.watermark = span_boundary.clone();
        self.right.watermark = span_boundary;
        Ok(())
    }

    fn pend_left(&mut self, buckets: Vec<Bucket>) {
        for bucket in buckets {
            self.pending_buckets.push((Some(bucket), None));
        }
    }

    fn pend_right(&mut self, buckets: Vec<Bucket>) {
        for bucket in buckets {
            self.pending_buckets.push((None, Some(bucket)));
        }
    }

    fn cut(&self) -> Cut {
        match (self.left.exhausted, self.right.exhausted) {
            (true, true) => Cut::All,
            (true, false) => match &self.right.watermark {
                Some(t) => Cut::UpTo(t.clone()),
                None => Cut::Nothing,
            },
            (false, true) => match &self.left.watermark {
                Some(t) => Cut::UpTo(t.clone()),
                None => Cut::Nothing,
            },
            (false, false) => match (&self.left.watermark, &self.right.watermark) {
                (Some(l), Some(r)) => Cut::UpTo(l.clone().min(r.clone())),
                _ => Cut::Nothing,
            },
        }
    }

    /// Pairs up buffered entries whose tuples both sides have fully covered.
    fn drain_nodes(&mut self) {
        let cut = self.cut();
        let within = |entry: &Entry| match &cut {
            Cut::All => true,
            Cut::UpTo(t) => entry.cmp_tuple(t).is_le(),
            Cut::Nothing => false,
        };
        loop {
            match (self.left.buf.front(), self.right.buf.front()) {
                (None, None) => break,
                (Some(l), None) => {
                    if !within(l) {
                        break;
                    }
                    let l = self.left.buf.pop_front().unwrap();
                    self.pending_nodes.push((Some(l), None));
                }
                (None, Some(r)) => {
                    if !within(r) {
                        break;
                    }
                    let r = self.right.buf.pop_front().unwrap();
                    self.pending_nodes.push((None, Some(r)));
                }
                (Some(l), Some(r)) => {
                    let ord = l.cmp_entry_tuple(r);
                    if ord.is_lt() {
                        if !within(l) {
                            break;
                        }
                        let l = self.left.buf.pop_front().unwrap();
                        self.pending_nodes.push((Some(l), None));
                    } else if ord.is_gt() {
                        if !within(r) {
                            break;
                        }
                        let r = self.right.buf.pop_front().unwrap();
                        self.pending_nodes.push((None, Some(r)));
                    } else {
                        if !within(l) {
                            break;
                        }
                        let l = self.left.buf.pop_front().unwrap();
                        let r = self.right.buf.pop_front().unwrap();
                        if l.message != r.message {
                            self.pending_nodes.push((Some(l), Some(r)));
                        }
                    }
                }
            }
        }
    }

    fn take_segment(&mut self) -> Option<ProllyTreeDiff> {
        cancel_equal_buckets(&mut self.pending_buckets);
        self.pending_buckets.sort_by(|a, b| bucket_sort_key(a).cmp(&bucket_sort_key(b)));

        if self.pending_nodes.is_empty() && self.pending_buckets.is_empty() {
            return None;
        }
        Some(ProllyTreeDiff {
            nodes: std::mem::take(&mut self.pending_nodes),
            buckets: std::mem::take(&mut self.pending_buckets),
        })
    }
}

fn bucket_sort_key(pair: &(Option<Bucket>, Option<Bucket>)) -> (Option<Tuple>, u32, bool) {
    let added = pair.0.is_none();
    let bucket = pair.0.as_ref().or(pair.1.as_ref()).unwrap();
    (
        bucket.boundary().map(|e| e.tuple()),
        bucket.level(),
        added,
    )
}

/// Consumes the current leaf bucket into the side's buffer, records newly
/// entered ancestors, and advances to the next leaf. Returns the buckets to
/// report for this side.
async fn pull<S: BlockStore>(side: &mut DiffSide<S>) -> Result<Vec<Bucket>> {
    let mut news = Vec::new();
    let stack = side.cursor.buckets();
    for bucket in &stack {
        if bucket.level() == 0 {
            continue;
        }
        if side.mark(bucket) {
            news.push(bucket.clone());
        }
    }

    let leaf = side.cursor.current_bucket();
    side.mark(&leaf);
    side.buf.extend(leaf.entries().iter().cloned());
    if let Some(boundary) = leaf.boundary() {
        side.watermark = Some(boundary.tuple());
    }
    news.push(leaf);

    side.cursor.next_bucket(Some(0)).await?;
    if side.cursor.done() {
        side.exhausted = true;
    }
    Ok(news)
}

/// Moves a side past the current bucket at `level` and back down to the leaf
/// level, or marks it exhausted at the end of the tree.
async fn advance_past<S: BlockStore>(side: &mut DiffSide<S>, level: u32) -> Result<()> {
    side.cursor.next_bucket(Some(level)).await?;
    if side.cursor.done() {
        side.exhausted = true;
        return Ok(());
    }
    if level > 0 {
        side.cursor.next(Some(0)).await?;
    }
    Ok(())
}

/// Convenience wrapper collecting every segment of a diff.
pub async fn diff_trees<L: BlockStore, R: BlockStore>(
    store_left: &Arc<L>,
    store_right: &Arc<R>,
    left_root: &Bucket,
    right_root: &Bucket,
) -> Result<Vec<ProllyTreeDiff>> {
    let mut differ = TreeDiff::new(
        Arc::clone(store_left),
        Arc::clone(store_right),
        left_root.clone(),
        right_root.clone(),
    )
    .await?;
    let mut segments = Vec::new();
    while let Some(segment) = differ.next().await? {
        segments.push(segment);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Prefix;
    use crate::common::TreeConfig;
    use crate::store::MemoryBlockStore;
    use crate::tree::io::store_bucket;

    fn entry(ts: i64, msg: &[u8]) -> Entry {
        Entry::new(ts, vec![0xf0, 0, 0, ts as u8], msg.to_vec())
    }

    async fn leaf_tree(store: &MemoryBlockStore, entries: Vec<Entry>) -> Bucket {
        let bucket = Bucket::new(
            Prefix::from_config(&TreeConfig::default(), 0),
            entries,
        )
        .unwrap();
        store_bucket(store, &bucket).await.unwrap();
        bucket
    }

    fn flatten(segments: Vec<ProllyTreeDiff>) -> Vec<(Option<Entry>, Option<Entry>)> {
        segments.into_iter().flat_map(|s| s.nodes).collect()
    }

    #[tokio::test]
    async fn identical_trees_diff_to_nothing() {
        let store = Arc::new(MemoryBlockStore::new());
        let root = leaf_tree(&store, vec![entry(1, b"a"), entry(2, b"b")]).await;

        let segments = diff_trees(&store, &store, &root, &root).await.unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn empty_trees_diff_to_nothing() {
        let store = Arc::new(MemoryBlockStore::new());
        let root = Bucket::empty(&TreeConfig::default()).unwrap();
        store_bucket(store.as_ref(), &root).await.unwrap();

        let segments = diff_trees(&store, &store, &root, &root).await.unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn disjoint_trees_report_both_sides() {
        let store = Arc::new(MemoryBlockStore::new());
        let left = leaf_tree(&store, vec![entry(1, b"a"), entry(2, b"b")]).await;
        let right = leaf_tree(&store, vec![entry(3, b"c")]).await;

        let nodes = flatten(diff_trees(&store, &store, &left, &right).await.unwrap());
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], (Some(entry(1, b"a")), None));
        assert_eq!(nodes[1], (Some(entry(2, b"b")), None));
        assert_eq!(nodes[2], (None, Some(entry(3, b"c"))));
    }

    #[tokio::test]
    async fn changed_message_reports_a_pair() {
        let store = Arc::new(MemoryBlockStore::new());
        let left = leaf_tree(&store, vec![entry(1, b"old"), entry(2, b"same")]).await;
        let right = leaf_tree(&store, vec![entry(1, b"new"), entry(2, b"same")]).await;

        let nodes = flatten(diff_trees(&store, &store, &left, &right).await.unwrap());
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0], (Some(entry(1, b"old")), Some(entry(1, b"new"))));
    }

    #[tokio::test]
    async fn empty_versus_populated_reports_additions() {
        let store = Arc::new(MemoryBlockStore::new());
        let empty = Bucket::empty(&TreeConfig::default()).unwrap();
        store_bucket(store.as_ref(), &empty).await.unwrap();
        let right = leaf_tree(&store, vec![entry(1, b"a")]).await;

        let segments = diff_trees(&store, &store, &empty, &right).await.unwrap();
        let nodes: Vec<_> = segments.iter().flat_map(|s| s.nodes.clone()).collect();
        assert_eq!(nodes, vec![(None, Some(entry(1, b"a")))]);

        // The empty root leaves, the populated root arrives.
        let buckets: Vec<_> = segments.into_iter().flat_map(|s| s.buckets).collect();
        assert!(buckets.contains(&(Some(empty), None)));
        assert!(buckets.contains(&(None, Some(right))));
    }
}
