//! Mutation engine: applies ordered updates to the leaf level, rechunks the
//! touched buckets, and propagates parent-entry changes upward one level at a
//! time until a single bucket spans its level. Diffs stream out as buckets
//! are produced.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;

use crate::bucket::{Bucket, Prefix};
use crate::diff::ProllyTreeDiff;
use crate::error::{ProllyError, Result};
use crate::node::{is_boundary, validate_entry_hash, Entry, Tuple};
use crate::store::BlockStore;
use crate::tree::cursor::Cursor;
use crate::tree::io;

/// A single requested change, applied by tuple.
#[derive(Debug, Clone)]
pub enum Update {
    /// Insert or replace the entry with this tuple.
    Add(Entry),
    /// Remove the entry with this tuple if present.
    Rm(Tuple),
}

impl Update {
    pub fn tuple(&self) -> Tuple {
        match self {
            Update::Add(entry) => entry.tuple(),
            Update::Rm(tuple) => tuple.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct LeveledUpdate {
    level: u32,
    update: Update,
}

/// Per-tuple reconciliation of an existing entry with an update.
/// Returns the surviving entry and the node diff, if any.
fn handle_update(
    existing: Option<&Entry>,
    update: &Update,
) -> (Option<Entry>, Option<(Option<Entry>, Option<Entry>)>) {
    match (existing, update) {
        (Some(node), Update::Add(add)) => {
            if node.message == add.message {
                (Some(node.clone()), None)
            } else {
                (
                    Some(add.clone()),
                    Some((Some(node.clone()), Some(add.clone()))),
                )
            }
        }
        (None, Update::Add(add)) => (Some(add.clone()), Some((None, Some(add.clone())))),
        (Some(node), Update::Rm(_)) => (None, Some((Some(node.clone()), None))),
        (None, Update::Rm(_)) => (None, None),
    }
}

struct RebuildOutcome {
    built: Vec<Bucket>,
    leftovers: Vec<Entry>,
    diffs: Vec<(Option<Entry>, Option<Entry>)>,
}

/// Rebuilds one bucket: merges carried leftovers, the bucket's entries, and
/// the sliced updates into one ordered stream, then chunks it at boundary
/// entries. Entries past the final boundary carry into the next sibling,
/// except at the head of the level where they are flushed.
fn rebuild_bucket(
    prefix: Prefix,
    existing: &[Entry],
    leftovers: Vec<Entry>,
    updates: &[Update],
    is_head: bool,
    level_is_bare: bool,
) -> Result<RebuildOutcome> {
    let mut diffs = Vec::new();
    let mut built = Vec::new();
    let mut acc: Vec<Entry> = Vec::new();

    let mut source = leftovers.into_iter().chain(existing.iter().cloned()).peekable();
    let mut pending = updates.iter().peekable();

    let push_entry = |entry: Entry, built: &mut Vec<Bucket>, acc: &mut Vec<Entry>| -> Result<()> {
        let closes = is_boundary(prefix.average, prefix.level, &entry);
        acc.push(entry);
        if closes {
            built.push(Bucket::new(prefix, std::mem::take(acc))?);
        }
        Ok(())
    };

    loop {
        let next = match (source.peek(), pending.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                let entry = source.next().unwrap();
                Some(entry)
            }
            (None, Some(_)) => {
                let update = pending.next().unwrap();
                let (survivor, diff) = handle_update(None, update);
                diffs.extend(diff);
                survivor
            }
            (Some(entry), Some(update)) => {
                let ord = entry.cmp_tuple(&update.tuple());
                if ord.is_lt() {
                    Some(source.next().unwrap())
                } else if ord.is_gt() {
                    let update = pending.next().unwrap();
                    let (survivor, diff) = handle_update(None, update);
                    diffs.extend(diff);
                    survivor
                } else {
                    let entry = source.next().unwrap();
                    let update = pending.next().unwrap();
                    let (survivor, diff) = handle_update(Some(&entry), update);
                    diffs.extend(diff);
                    survivor
                }
            }
        };
        if let Some(entry) = next {
            push_entry(entry, &mut built, &mut acc)?;
        }
    }

    let mut leftovers = acc;
    if is_head && !leftovers.is_empty() {
        built.push(Bucket::new(prefix, std::mem::take(&mut leftovers))?);
    } else if is_head && built.is_empty() && level_is_bare && prefix.level == 0 {
        // The level would otherwise vanish entirely; level zero keeps the
        // canonical empty bucket.
        built.push(Bucket::new(prefix, Vec::new())?);
    }

    Ok(RebuildOutcome {
        built,
        leftovers,
        diffs,
    })
}

struct RoundOutcome {
    built: usize,
    at_head: bool,
    last_boundary: Option<Tuple>,
}

/// A streaming mutation session over one tree.
///
/// Pull diffs with [`Mutation::next`] until it returns `None`; the new root
/// is available from [`Mutation::new_root`] only after a successful drain.
/// Nothing is committed on an error path, and the old tree remains intact
/// either way since buckets are only ever added to the store.
pub struct Mutation<S: BlockStore> {
    store: Arc<S>,
    cursor: Cursor<S>,
    prefix: Prefix,
    updates: VecDeque<LeveledUpdate>,
    leftovers: Vec<Entry>,
    level: u32,
    buckets_on_level: usize,
    last_built_on_level: Option<Bucket>,
    visited_tail: bool,
    visited_head: bool,
    first_visit_on_level: bool,
    pending_nodes: Vec<(Option<Entry>, Option<Entry>)>,
    pending_buckets: Vec<(Option<Bucket>, Option<Bucket>)>,
    new_root: Option<Bucket>,
    finished: bool,
}

impl<S: BlockStore> Mutation<S> {
    /// Starts a mutation session. `updates` must be strictly ascending by
    /// tuple with no duplicates; violations are rejected up front.
    pub fn new(store: Arc<S>, root: Bucket, updates: Vec<Update>) -> Result<Self> {
        for update in &updates {
            if let Update::Add(entry) = update {
                validate_entry_hash(&entry.hash)?;
            }
        }
        for pair in updates.windows(2) {
            if pair[0].tuple() >= pair[1].tuple() {
                return Err(ProllyError::BadInput(
                    "updates must be strictly ascending by tuple with no duplicates"
                        .to_string(),
                ));
            }
        }

        let prefix = root.prefix().at_level(0);
        let finished = updates.is_empty();
        let new_root = finished.then(|| root.clone());
        let cursor = Cursor::new(Arc::clone(&store), root);
        Ok(Mutation {
            store,
            cursor,
            prefix,
            updates: updates
                .into_iter()
                .map(|update| LeveledUpdate { level: 0, update })
                .collect(),
            leftovers: Vec::new(),
            level: 0,
            buckets_on_level: 0,
            last_built_on_level: None,
            visited_tail: false,
            visited_head: false,
            first_visit_on_level: true,
            pending_nodes: Vec::new(),
            pending_buckets: Vec::new(),
            new_root,
            finished,
        })
    }

    /// The root of the rebuilt tree, available once the stream is drained.
    pub fn new_root(&self) -> Option<&Bucket> {
        if self.finished {
            self.new_root.as_ref()
        } else {
            None
        }
    }

    /// Produces the next diff segment, or `None` when the mutation is done.
    pub async fn next(&mut self) -> Result<Option<ProllyTreeDiff>> {
        loop {
            if self.finished {
                return Ok(self.take_segment(None, true));
            }
            if self.updates.is_empty() && self.leftovers.is_empty() {
                return Err(ProllyError::NoNewRoot);
            }
            let outcome = self.round().await?;
            if self.finished || outcome.built > 0 {
                let cut = if outcome.at_head || self.finished {
                    None
                } else {
                    outcome.last_boundary
                };
                if let Some(diff) = self.take_segment(cut.as_ref(), self.finished) {
                    return Ok(Some(diff));
                }
            }
        }
    }

    async fn round(&mut self) -> Result<RoundOutcome> {
        let level = if self.leftovers.is_empty() {
            self.updates.front().unwrap().level
        } else {
            self.level
        };
        if level != self.level {
            debug_assert!(level > self.level, "updates may only move upward");
            debug_assert!(self.leftovers.is_empty());
            self.level = level;
            self.buckets_on_level = 0;
            self.last_built_on_level = None;
            self.visited_tail = false;
            self.visited_head = false;
            self.first_visit_on_level = true;
        }
        trace!("mutation round at level {level}");

        // Locate the bucket to rebuild. Above the root, or past the head of
        // the level, the updatee is synthetic and empty.
        let mut updatee: Option<Bucket> = None;
        if level <= self.cursor.root_level() && !self.cursor.done() {
            if !self.leftovers.is_empty() {
                self.cursor.next_bucket(Some(level)).await?;
            } else {
                let first = self.updates.front().unwrap().update.tuple();
                if self.cursor.level() == level {
                    // Within a level updates only move forward.
                    self.cursor.next_tuple(&first, Some(level)).await?;
                } else {
                    // First visit on this level: re-aim from the root, since
                    // the cursor may sit under a later ancestor.
                    self.cursor.jump_to(&first, level).await?;
                }
            }
            if !self.cursor.done() {
                updatee = Some(self.cursor.current_bucket());
            }
        }
        let at_head = match &updatee {
            Some(_) => self.cursor.is_at_head(),
            None => true,
        };
        if self.first_visit_on_level {
            self.visited_tail = match &updatee {
                Some(_) => self.cursor.is_at_tail(),
                None => true,
            };
            self.first_visit_on_level = false;
        }
        if at_head {
            self.visited_head = true;
        }

        // Slice off the updates that belong to this bucket.
        let boundary_tuple = updatee
            .as_ref()
            .and_then(|b| b.boundary())
            .map(|e| e.tuple());
        let mut batch: Vec<Update> = Vec::new();
        while let Some(front) = self.updates.front() {
            if front.level != level {
                break;
            }
            let take = at_head
                || match &boundary_tuple {
                    Some(boundary) => front.update.tuple() <= *boundary,
                    None => true,
                };
            if !take {
                break;
            }
            batch.push(self.updates.pop_front().unwrap().update);
        }

        let prefix = self.prefix.at_level(level);
        let existing: &[Entry] = updatee.as_ref().map(|b| b.entries()).unwrap_or(&[]);
        let leftovers = std::mem::take(&mut self.leftovers);
        // The level only counts as bare if nothing was built AND the walk
        // started at its tail; otherwise untouched buckets remain to its left.
        let level_is_bare = self.buckets_on_level == 0 && self.visited_tail;
        let outcome = rebuild_bucket(prefix, existing, leftovers, &batch, at_head, level_is_bare)?;

        for bucket in &outcome.built {
            io::store_bucket(self.store.as_ref(), bucket).await?;
        }

        self.leftovers = outcome.leftovers;
        self.buckets_on_level += outcome.built.len();
        if let Some(last) = outcome.built.last() {
            self.last_built_on_level = Some(last.clone());
        }
        let changed = !outcome.diffs.is_empty();
        if level == 0 {
            self.pending_nodes.extend(outcome.diffs);
        }

        if let Some(bucket) = &updatee {
            self.pending_buckets.push((Some(bucket.clone()), None));
        }
        for bucket in &outcome.built {
            self.pending_buckets.push((None, Some(bucket.clone())));
        }

        // A single bucket spanning a fully visited level is the new root.
        if self.buckets_on_level == 1
            && self.leftovers.is_empty()
            && self.visited_tail
            && self.visited_head
        {
            let mut root = self
                .last_built_on_level
                .clone()
                .ok_or(ProllyError::NoNewRoot)?;
            trace!("new root found at level {} ({root:?})", root.level());
            // A root holding a single child entry is non-canonical; descend
            // until the root either is a leaf or spans more than one child.
            while root.level() > 0 && root.len() == 1 {
                let child_prefix = root.prefix().at_level(root.level() - 1);
                let child = io::load_bucket(
                    self.store.as_ref(),
                    &root.entries()[0].message,
                    &child_prefix,
                )
                .await?;
                trace!("collapsing single-entry root at level {}", root.level());
                self.pending_buckets.push((Some(root.clone()), None));
                root = child;
            }
            self.emit_shrinkage_removals(root.level());
            self.new_root = Some(root);
            self.updates.clear();
            self.finished = true;
            return Ok(RoundOutcome {
                built: outcome.built.len(),
                at_head,
                last_boundary: None,
            });
        }

        // Propagate this bucket's changes one level up.
        for bucket in &outcome.built {
            if let Some(parent) = bucket.parent_entry() {
                self.push_update(level + 1, Update::Add(parent));
            }
        }
        if changed {
            if let Some(parent) = updatee.as_ref().and_then(|b| b.parent_entry()) {
                self.push_update(level + 1, Update::Rm(parent.tuple()));
            }
        }

        let last_boundary = outcome
            .built
            .last()
            .and_then(|b| b.boundary())
            .map(|e| e.tuple());
        Ok(RoundOutcome {
            built: outcome.built.len(),
            at_head,
            last_boundary,
        })
    }

    /// Sorted insertion with same-tuple coalescing: a rebuilt bucket's `Add`
    /// supersedes the `Rm` of the bucket it replaced at the same boundary
    /// tuple, keeping the queue strictly ascending per level.
    fn push_update(&mut self, level: u32, update: Update) {
        let key = (level, update.tuple());
        let mut at = self.updates.len();
        while at > 0 {
            let probe = &self.updates[at - 1];
            let probe_key = (probe.level, probe.update.tuple());
            if probe_key < key {
                break;
            }
            if probe_key == key {
                if matches!(update, Update::Add(_)) {
                    self.updates[at - 1].update = update;
                }
                return;
            }
            at -= 1;
        }
        self.updates.insert(at, LeveledUpdate { level, update });
    }

    /// When the tree shrank, the ancestors of the original path above the
    /// final level no longer exist.
    fn emit_shrinkage_removals(&mut self, final_level: u32) {
        if final_level >= self.cursor.root_level() {
            return;
        }
        for bucket in self.cursor.buckets() {
            if bucket.level() > final_level {
                self.pending_buckets.push((Some(bucket), None));
            }
        }
    }

    fn take_segment(
        &mut self,
        cut: Option<&Tuple>,
        flush_all: bool,
    ) -> Option<ProllyTreeDiff> {
        cancel_equal_buckets(&mut self.pending_buckets);

        let nodes = if flush_all || cut.is_none() {
            std::mem::take(&mut self.pending_nodes)
        } else {
            let cut = cut.unwrap();
            let split = self
                .pending_nodes
                .iter()
                .position(|(left, right)| {
                    let entry = left.as_ref().or(right.as_ref());
                    entry.map(|e| e.cmp_tuple(cut).is_gt()).unwrap_or(false)
                })
                .unwrap_or(self.pending_nodes.len());
            self.pending_nodes.drain(..split).collect()
        };
        let buckets = std::mem::take(&mut self.pending_buckets);

        if nodes.is_empty() && buckets.is_empty() {
            None
        } else {
            Some(ProllyTreeDiff { nodes, buckets })
        }
    }
}

/// Drops removed/added bucket pairs with identical content; replacing a
/// bucket with its byte-identical twin is not a structural change.
pub(crate) fn cancel_equal_buckets(pending: &mut Vec<(Option<Bucket>, Option<Bucket>)>) {
    let mut drop = vec![false; pending.len()];
    for i in 0..pending.len() {
        if drop[i] {
            continue;
        }
        let removed = match &pending[i] {
            (Some(bucket), None) => bucket.clone(),
            _ => continue,
        };
        for j in 0..pending.len() {
            if drop[j] {
                continue;
            }
            if let (None, Some(added)) = &pending[j] {
                if *added == removed {
                    drop[i] = true;
                    drop[j] = true;
                    break;
                }
            }
        }
    }
    let mut keep = drop.iter().copied();
    pending.retain(|_| !keep.next().unwrap());
}
