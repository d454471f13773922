//! Ordered range scan over a [`super::Tree`] (spec §5), grounded in
//! `src/storage/btree/tree/definition/cursor.rs`'s leaf-then-right-sibling
//! walk, generalized with a traversal direction and depth mode (spec §4.2
//! "Traverse / Cursor").

use crate::codec::{encode_key, KeyBound};
use crate::error::Result;
use crate::page::PageId;
use crate::pager::{PageSource, TaskId};

use super::tree::Tree;

/// Which way a traversal walks relative to its anchor key, and whether the
/// anchor itself is included (spec §4.2 "Traverse").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Ascending, strictly greater than the anchor.
    Gt,
    /// Ascending, greater than or equal to the anchor.
    GtEq,
    /// Descending, strictly less than the anchor.
    Lt,
    /// Descending, less than or equal to the anchor.
    LtEq,
    /// At most the single entry matching the anchor exactly.
    Eq,
}

impl Direction {
    fn is_descending(self) -> bool {
        matches!(self, Direction::Lt | Direction::LtEq)
    }
}

/// How much of a matching cell a traversal resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthMode {
    /// Stop at the stored cell bytes; a long-record cell comes back as its
    /// raw descriptor rather than being dereferenced.
    Shallow,
    /// Dereference long-record chains into the full value, as [`Tree::get`]
    /// does.
    Deep,
}

/// Iterator over a key range, walking either toward the right sibling
/// (ascending) or the left sibling (descending). Holds no page claims
/// between calls to [`Cursor::next`]; each call claims only the leaf it is
/// currently positioned on.
pub struct Cursor<'t, S: PageSource> {
    tree: &'t Tree<S>,
    task: TaskId,
    lo: KeyBound,
    hi: KeyBound,
    direction: Direction,
    depth: DepthMode,
    current_leaf: Option<PageId>,
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    sibling: Option<PageId>,
    done: bool,
}

impl<'t, S: PageSource> Cursor<'t, S> {
    pub(super) fn new(
        tree: &'t Tree<S>,
        task: TaskId,
        lo: KeyBound,
        hi: KeyBound,
        direction: Direction,
        depth: DepthMode,
    ) -> Result<Self> {
        let descending = direction.is_descending();
        let seek_bytes = if descending { upper_bound_bytes(&hi) } else { lower_bound_bytes(&lo) };
        let path = tree.find_path(task, &seek_bytes)?;
        let leaf_id = *path.last().expect("path always has at least the root");
        let (hdr, mut entries) = tree.load_leaf(task, leaf_id)?;

        if descending {
            let end = entries.partition_point(|(k, _)| satisfies_upper(&hi, k));
            entries.truncate(end);
            entries.reverse();
            Ok(Cursor {
                tree,
                task,
                lo,
                hi,
                direction,
                depth,
                current_leaf: Some(leaf_id),
                entries: entries.into_iter(),
                sibling: hdr.left_sibling,
                done: false,
            })
        } else {
            let start = entries.partition_point(|(k, _)| !satisfies_lower(&lo, k));
            Ok(Cursor {
                tree,
                task,
                lo,
                hi,
                direction,
                depth,
                current_leaf: Some(leaf_id),
                entries: entries[start..].to_vec().into_iter(),
                sibling: hdr.right_sibling,
                done: false,
            })
        }
    }

    fn advance_leaf(&mut self) -> Result<bool> {
        let descending = self.direction.is_descending();
        loop {
            match self.sibling {
                None => {
                    self.current_leaf = None;
                    return Ok(false);
                }
                Some(next) => {
                    let (hdr, mut entries) = self.tree.load_leaf(self.task, next)?;
                    self.current_leaf = Some(next);
                    self.sibling = if descending { hdr.left_sibling } else { hdr.right_sibling };
                    if entries.is_empty() {
                        continue;
                    }
                    if descending {
                        entries.reverse();
                    }
                    self.entries = entries.into_iter();
                    return Ok(true);
                }
            }
        }
    }

    /// Returns the next `(encoded key, value)` pair in range, or `None` once
    /// the scan is exhausted.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        let descending = self.direction.is_descending();
        loop {
            match self.entries.next() {
                Some((key, cell)) => {
                    let in_range =
                        if descending { satisfies_lower(&self.lo, &key) } else { satisfies_upper(&self.hi, &key) };
                    if !in_range {
                        self.done = true;
                        return Ok(None);
                    }
                    let value = match self.depth {
                        DepthMode::Deep => self.tree.materialize(self.task, &cell)?,
                        DepthMode::Shallow => cell,
                    };
                    if matches!(self.direction, Direction::Eq) {
                        self.done = true;
                    }
                    return Ok(Some((key, value)));
                }
                None => {
                    if self.current_leaf.is_none() || !self.advance_leaf()? {
                        self.done = true;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

fn lower_bound_bytes(lo: &KeyBound) -> Vec<u8> {
    match lo {
        KeyBound::Before => Vec::new(),
        KeyBound::After => vec![0xFF],
        KeyBound::Inclusive(k) | KeyBound::Exclusive(k) => encode_key(k),
    }
}

fn upper_bound_bytes(hi: &KeyBound) -> Vec<u8> {
    match hi {
        KeyBound::After => vec![0xFF],
        KeyBound::Before => Vec::new(),
        KeyBound::Inclusive(k) | KeyBound::Exclusive(k) => encode_key(k),
    }
}

fn satisfies_lower(lo: &KeyBound, candidate: &[u8]) -> bool {
    match lo {
        KeyBound::Before => true,
        KeyBound::After => false,
        KeyBound::Inclusive(k) => candidate >= encode_key(k).as_slice(),
        KeyBound::Exclusive(k) => candidate > encode_key(k).as_slice(),
    }
}

fn satisfies_upper(hi: &KeyBound, candidate: &[u8]) -> bool {
    match hi {
        KeyBound::After => true,
        KeyBound::Before => false,
        KeyBound::Inclusive(k) => candidate <= encode_key(k).as_slice(),
        KeyBound::Exclusive(k) => candidate < encode_key(k).as_slice(),
    }
}
