//! Tree searches.

use std::cmp::Ordering;
use std::ops::{BitOr, BitOrAssign};

use apfs_core::key::{compare, Key};

use super::{Btree, BtreeKind, Node, NodeIo, MAX_DEPTH};
use crate::error::{Error, Result};
use crate::metrics::Metric;

/// Search modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// Return every record matching the key, one per call to [`Query::run`].
    pub const MULTIPLE: Self = Self(0x01);
    /// Set internally once a multiple query has returned its first record.
    pub const NEXT: Self = Self(0x02);
    /// Only report a record that matches the key.
    pub const EXACT: Self = Self(0x04);
    /// Ignore the name of the key when matching.
    pub const ANY_NAME: Self = Self(0x08);
    /// Ignore the number (hash, sibling id, xid) of the key when matching.
    pub const ANY_NUMBER: Self = Self(0x10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One level of the path from the root to the current record.
#[derive(Clone)]
pub struct Frame {
    pub node: Node,
    /// Child followed in an internal node, current record in the leaf.
    pub index: usize,
}

/// A search cursor.
///
/// The frames are the explicit descent path, root first. After a successful run the last
/// frame is the leaf holding the match, and `index`, `key_off`, `key_len`, `off` and `len`
/// locate it. Nodes are owned copies, so a query keeps seeing the tree as it was when it
/// descended, even if the tree is modified afterwards.
pub struct Query {
    pub key: Key,
    pub flags: QueryFlags,
    frames: Vec<Frame>,
    pub index: usize,
    pub key_off: usize,
    pub key_len: usize,
    pub off: usize,
    pub len: usize,
}

impl Query {
    pub fn new(key: Key, flags: QueryFlags) -> Self {
        Query {
            key,
            flags,
            frames: Vec::new(),
            index: 0,
            key_off: 0,
            key_len: 0,
            off: 0,
            len: 0,
        }
    }

    /// Runs the search.
    ///
    /// Returns `false` when no record qualifies. A multiple query returns its matches one
    /// by one on successive calls and `false` once they are exhausted.
    ///
    /// Without [`QueryFlags::EXACT`] the cursor is left at the position where the key
    /// belongs, and the return value says whether the record there is equal to the key.
    pub fn run(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        let _timer = io.metrics().record(Metric::QueryTime);

        if self.flags.contains(QueryFlags::NEXT) {
            if !self.step(tree, io)? {
                return Ok(false);
            }
            return self.check_current(tree);
        }

        self.descend(tree, io)?;
        let found = if tree.kind == BtreeKind::Omap {
            self.position_floor(tree)?
        } else {
            self.position_lower_bound(tree, io)?
        };
        if self.flags.contains(QueryFlags::MULTIPLE) {
            self.flags |= QueryFlags::NEXT;
        }
        Ok(found)
    }

    /// Positions the cursor where the key belongs and reports whether an equal record is
    /// there. Ignores the search flags.
    pub(super) fn seek(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        self.flags = QueryFlags::default();
        self.descend(tree, io)?;
        if tree.kind != BtreeKind::Omap {
            return self.position_lower_bound(tree, io);
        }
        // The floor descent already picked the only leaf that can hold the key.
        let index = self.partition(tree, &self.leaf().node, false)?;
        self.set_index(index);
        if index == self.leaf().node.record_count() {
            return Ok(false);
        }
        self.check_current(tree)
    }

    fn ignore(&self) -> (bool, bool) {
        (
            self.flags.contains(QueryFlags::ANY_NUMBER),
            self.flags.contains(QueryFlags::ANY_NAME),
        )
    }

    fn cmp_at(&self, tree: &Btree, node: &Node, index: usize) -> Result<Ordering> {
        let (ignore_number, ignore_name) = self.ignore();
        let stored = tree.kind.decode_key(node.key(index))?;
        Ok(compare(&stored, &self.key, ignore_number, ignore_name))
    }

    /// Number of records in `node` that sort before the key (or equal to it, with `or_equal`).
    fn partition(&self, tree: &Btree, node: &Node, or_equal: bool) -> Result<usize> {
        let (mut lo, mut hi) = (0, node.record_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let before = match self.cmp_at(tree, node, mid)? {
                Ordering::Less => true,
                Ordering::Equal => or_equal,
                Ordering::Greater => false,
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Walks from the root down to a leaf.
    ///
    /// Object map searches follow the last child whose first key is not above the key, which
    /// finds the greatest record not above it. Other searches follow the last child whose
    /// first key is strictly below the key, so that every record sharing a prefix with the
    /// key is at or after the leaf position.
    fn descend(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<()> {
        self.frames.clear();
        let floor = tree.kind == BtreeKind::Omap;
        let mut oid = tree.root;
        let mut expected_level = None;
        loop {
            if self.frames.len() >= MAX_DEPTH {
                return Err(Error::corrupted(format!(
                    "{:?} tree deeper than {MAX_DEPTH} levels",
                    tree.kind
                )));
            }
            let node = io.read_node(tree, oid)?;
            if node.is_root() != self.frames.is_empty() {
                return Err(Error::corrupted(format!(
                    "{:?} tree node 0x{oid:x}: misplaced root flag",
                    tree.kind
                )));
            }
            if let Some(level) = expected_level {
                if node.level() != level {
                    return Err(Error::corrupted(format!(
                        "{:?} tree node 0x{oid:x}: level {} below level {}",
                        tree.kind,
                        node.level(),
                        level + 1
                    )));
                }
            }
            if node.is_leaf() {
                self.frames.push(Frame { node, index: 0 });
                return Ok(());
            }
            if node.record_count() == 0 {
                return Err(Error::corrupted(format!(
                    "{:?} tree node 0x{oid:x}: empty internal node",
                    tree.kind
                )));
            }
            let index = self.partition(tree, &node, floor)?.saturating_sub(1);
            oid = node.child_oid(index)?;
            expected_level = Some(node.level() - 1);
            self.frames.push(Frame { node, index });
        }
    }

    fn leaf(&self) -> &Frame {
        // UNWRAP: only called after a descent, which always ends in a leaf.
        self.frames.last().unwrap()
    }

    fn position_floor(&mut self, tree: &Btree) -> Result<bool> {
        let leaf = &self.leaf().node;
        let after = self.partition(tree, leaf, true)?;
        if after == 0 {
            return Ok(false);
        }
        let index = after - 1;
        let (_, ignore_name) = self.ignore();
        let stored = tree.kind.decode_key(leaf.key(index))?;
        // The floor record only counts if it belongs to the same object.
        let found = compare(&stored, &self.key, true, ignore_name) == Ordering::Equal;
        self.set_index(index);
        if found {
            self.record_location()?;
        }
        Ok(found)
    }

    fn position_lower_bound(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        let index = self.partition(tree, &self.leaf().node, false)?;
        self.set_index(index);
        if index == self.leaf().node.record_count() {
            if !self.next_leaf(tree, io)? {
                // The cursor stays past the end of the last leaf, where an insert appends.
                return Ok(false);
            }
        }
        self.check_current(tree)
    }

    fn check_current(&mut self, tree: &Btree) -> Result<bool> {
        let frame = self.leaf();
        let found = self.cmp_at(tree, &frame.node, frame.index)? == Ordering::Equal;
        if found {
            self.record_location()?;
        }
        Ok(found)
    }

    fn set_index(&mut self, index: usize) {
        // UNWRAP: only called after a descent.
        self.frames.last_mut().unwrap().index = index;
        self.index = index;
    }

    fn record_location(&mut self) -> Result<()> {
        let frame = self.leaf();
        let (key_off, key_len) = frame.node.key_range(frame.index)?;
        let (off, len) = frame.node.value_range(frame.index)?;
        self.index = frame.index;
        self.key_off = key_off;
        self.key_len = key_len;
        self.off = off;
        self.len = len;
        Ok(())
    }

    /// Moves the cursor to the first record of the next leaf. On failure the cursor is left
    /// where it was.
    fn next_leaf(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        // Find the deepest ancestor with a child to the right.
        let mut depth = self.frames.len() - 1;
        loop {
            if depth == 0 {
                return Ok(false);
            }
            depth -= 1;
            let frame = &self.frames[depth];
            if frame.index + 1 < frame.node.record_count() {
                break;
            }
        }

        self.frames[depth].index += 1;
        self.frames.truncate(depth + 1);
        loop {
            let frame = &self.frames[self.frames.len() - 1];
            if frame.node.is_leaf() {
                break;
            }
            let parent_level = frame.node.level();
            let oid = frame.node.child_oid(frame.index)?;
            let node = io.read_node(tree, oid)?;
            if node.level() + 1 != parent_level || node.is_root() {
                return Err(Error::corrupted(format!(
                    "{:?} tree node 0x{oid:x}: inconsistent level",
                    tree.kind
                )));
            }
            if node.record_count() == 0 {
                return Err(Error::corrupted(format!(
                    "{:?} tree node 0x{oid:x}: empty node",
                    tree.kind
                )));
            }
            self.frames.push(Frame { node, index: 0 });
        }
        self.index = 0;
        Ok(true)
    }

    /// Advances to the following record in key order, without checking it against the key.
    ///
    /// Returns `false` at the end of the tree.
    pub fn step(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        if self.frames.is_empty() {
            return Ok(false);
        }
        let frame = self.leaf();
        if frame.index + 1 < frame.node.record_count() {
            let index = frame.index + 1;
            self.set_index(index);
            return Ok(true);
        }
        self.next_leaf(tree, io)
    }

    /// Positions the cursor on the first record of the tree.
    pub fn first(&mut self, tree: &Btree, io: &dyn NodeIo) -> Result<bool> {
        self.key = Key::default();
        self.flags = QueryFlags::default();
        self.descend(tree, io)?;
        self.set_index(0);
        if self.leaf().node.record_count() == 0 {
            return Ok(false);
        }
        Ok(true)
    }

    /// Whether the cursor sits on a record.
    pub fn on_record(&self) -> bool {
        self.frames
            .last()
            .is_some_and(|frame| frame.index < frame.node.record_count())
    }

    /// Key of the record under the cursor.
    pub fn current_key(&self) -> &[u8] {
        debug_assert!(self.on_record(), "cursor is not on a record");
        let frame = self.leaf();
        frame.node.key(frame.index)
    }

    /// Value of the record under the cursor.
    pub fn current_value(&self) -> &[u8] {
        debug_assert!(self.on_record(), "cursor is not on a record");
        let frame = self.leaf();
        frame.node.value(frame.index)
    }

    /// Key of the last match.
    pub fn key_bytes(&self) -> &[u8] {
        self.leaf().node.bytes(self.key_off, self.key_len)
    }

    /// Value of the last match.
    pub fn value(&self) -> &[u8] {
        self.leaf().node.bytes(self.off, self.len)
    }

    /// Gives up the descent path, root first.
    pub(super) fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}
