//! Copy-on-write B-trees.
//!
//! A [`Btree`] is a small handle: its kind, the oid of its root and the statistics kept in
//! the root's trailer. Nodes are fetched and stored through a [`NodeIo`], which hides the
//! difference between physical trees (oid = block number) and virtual trees (oid resolved
//! through the object map) and performs copy-on-write when a node from an older transaction
//! is modified.
//!
//! Searches are driven by a [`Query`], which keeps the full root-to-leaf path of the last
//! search. Updates reuse that path to edit the tree bottom-up.

use std::cmp::Ordering;

use apfs_core::key::{compare, read_cat_key, read_pair_key, Key, KeyRef};
use apfs_core::node::{BtreeInfo, BTREE_FIXED_KV, BTREE_PHYSICAL};
use apfs_core::object::{
    OBJECT_TYPE_BLOCKREFTREE, OBJECT_TYPE_FSTREE, OBJECT_TYPE_OMAP, OBJECT_TYPE_SNAPMETATREE,
    OBJECT_TYPE_SPACEMAN_FREE_QUEUE,
};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::object::Object;

pub mod node;
pub mod query;
mod update;


pub use node::{FixedKv, Node};
pub use query::{Query, QueryFlags};

/// Deepest tree a search will descend before giving up on a corrupted structure.
pub const MAX_DEPTH: usize = 12;

/// The five kinds of tree in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtreeKind {
    /// Object map: `(oid, xid) -> (flags, size, paddr)`.
    Omap,
    /// Filesystem records keyed by `(cnid, type, ...)`.
    Catalog,
    ExtentRef,
    SnapMeta,
    /// Blocks waiting for reuse: `(xid, paddr) -> count`.
    FreeQueue,
}

/// How the nodes of a tree are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// The oid is the block number.
    Physical,
    /// The oid is resolved through the object map.
    Virtual,
}

impl BtreeKind {
    pub fn fixed(&self) -> Option<FixedKv> {
        match self {
            BtreeKind::Omap => Some(FixedKv {
                key_size: 16,
                val_size: 16,
            }),
            BtreeKind::FreeQueue => Some(FixedKv {
                key_size: 16,
                val_size: 8,
            }),
            _ => None,
        }
    }

    pub fn storage(&self) -> Storage {
        match self {
            BtreeKind::Catalog => Storage::Virtual,
            _ => Storage::Physical,
        }
    }

    /// The object subtype stamped on every node of the tree.
    pub fn subtype(&self) -> u32 {
        match self {
            BtreeKind::Omap => OBJECT_TYPE_OMAP,
            BtreeKind::Catalog => OBJECT_TYPE_FSTREE,
            BtreeKind::ExtentRef => OBJECT_TYPE_BLOCKREFTREE,
            BtreeKind::SnapMeta => OBJECT_TYPE_SNAPMETATREE,
            BtreeKind::FreeQueue => OBJECT_TYPE_SPACEMAN_FREE_QUEUE,
        }
    }

    pub fn decode_key<'a>(&self, raw: &'a [u8]) -> Result<KeyRef<'a>> {
        let key = match self {
            BtreeKind::Omap | BtreeKind::FreeQueue => read_pair_key(raw)?,
            _ => read_cat_key(raw)?,
        };
        Ok(key)
    }
}

/// Statistics kept in the trailer of the root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtreeStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: u32,
    pub longest_val: u32,
}

/// Node storage used by the tree algorithms.
pub trait NodeIo {
    fn block_size(&self) -> usize;

    /// Fetches the current version of node `oid` of `tree`.
    fn read_node(&self, tree: &Btree, oid: u64) -> Result<Node>;

    /// Reserves a new node object for `tree` in the current transaction.
    fn alloc_node(&mut self, tree: &Btree) -> Result<Object>;

    /// Stores `node`. A node belonging to an older transaction is copied first, which may
    /// change `node.object`.
    fn write_node(&mut self, tree: &Btree, node: &mut Node) -> Result<()>;

    /// Releases a node that is no longer referenced.
    fn free_node(&mut self, tree: &Btree, object: &Object) -> Result<()>;

    fn metrics(&self) -> &Metrics;
}

/// A handle to one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Btree {
    pub kind: BtreeKind,
    /// Oid of the root node. Virtual trees keep the same root oid forever.
    pub root: u64,
    pub stats: BtreeStats,
}

/// Totals gathered by [`Btree::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: u32,
    pub longest_val: u32,
    pub height: u16,
}

impl Btree {
    /// Creates an empty tree made of a single root leaf.
    pub fn create(io: &mut dyn NodeIo, kind: BtreeKind) -> Result<Self> {
        let mut tree = Btree {
            kind,
            root: 0,
            stats: BtreeStats {
                node_count: 1,
                ..Default::default()
            },
        };
        let object = io.alloc_node(&tree)?;
        tree.root = object.oid;
        let mut root = Node::new(object, io.block_size(), 0, true, kind.fixed());
        tree.write(io, &mut root)?;
        Ok(tree)
    }

    /// Opens the tree rooted at `root`, loading its statistics.
    pub fn open(io: &dyn NodeIo, kind: BtreeKind, root: u64) -> Result<Self> {
        let mut tree = Btree {
            kind,
            root,
            stats: BtreeStats::default(),
        };
        let node = io.read_node(&tree, root)?;
        let info = match node.info()? {
            Some(info) => info,
            None => {
                return Err(Error::corrupted(format!(
                    "{kind:?} tree root 0x{root:x} is not flagged as a root"
                )))
            }
        };
        let expected = tree.info(io.block_size());
        if info.flags != expected.flags
            || info.key_size != expected.key_size
            || info.val_size != expected.val_size
            || info.node_size != expected.node_size
        {
            return Err(Error::corrupted(format!(
                "{kind:?} tree root 0x{root:x} has an unexpected layout"
            )));
        }
        tree.stats = BtreeStats {
            key_count: info.key_count,
            node_count: info.node_count,
            longest_key: info.longest_key,
            longest_val: info.longest_val,
        };
        Ok(tree)
    }

    /// The trailer to store in the root node.
    pub fn info(&self, block_size: usize) -> BtreeInfo {
        let mut flags = 0;
        if self.kind.storage() == Storage::Physical {
            flags |= BTREE_PHYSICAL;
        }
        let fixed = self.kind.fixed();
        if fixed.is_some() {
            flags |= BTREE_FIXED_KV;
        }
        BtreeInfo {
            flags,
            node_size: block_size as u32,
            key_size: fixed.map_or(0, |f| f.key_size as u32),
            val_size: fixed.map_or(0, |f| f.val_size as u32),
            longest_key: self.stats.longest_key,
            longest_val: self.stats.longest_val,
            key_count: self.stats.key_count,
            node_count: self.stats.node_count,
        }
    }

    /// Writes a node of this tree, following the root if it moved.
    fn write(&mut self, io: &mut dyn NodeIo, node: &mut Node) -> Result<()> {
        io.write_node(self, node)?;
        if node.is_root() {
            self.root = node.object.oid;
        }
        Ok(())
    }

    /// Exact lookup returning a copy of the value.
    pub fn get(&self, io: &dyn NodeIo, key: &Key) -> Result<Option<Vec<u8>>> {
        let mut query = Query::new(key.clone(), QueryFlags::EXACT);
        if !query.run(self, io)? {
            return Ok(None);
        }
        Ok(Some(query.value().to_vec()))
    }

    /// Visits every node depth-first, checking the shape of the tree on the way.
    ///
    /// Checked: root flag only on the root, levels decreasing by one towards the leaves,
    /// strictly increasing keys across the whole tree, and every separator equal to the first
    /// key of its child.
    pub fn walk(
        &self,
        io: &dyn NodeIo,
        visit: &mut dyn FnMut(&Node) -> Result<()>,
    ) -> Result<WalkStats> {
        struct Pending {
            oid: u64,
            level: Option<u16>,
            separator: Option<Vec<u8>>,
            depth: usize,
        }

        let corrupt = |oid: u64, what: &str| {
            Error::corrupted(format!("{:?} tree node 0x{oid:x}: {what}", self.kind))
        };

        let mut stats = WalkStats::default();
        let mut last_key: Option<Vec<u8>> = None;
        let mut stack = vec![Pending {
            oid: self.root,
            level: None,
            separator: None,
            depth: 0,
        }];

        while let Some(pending) = stack.pop() {
            if pending.depth >= MAX_DEPTH {
                return Err(corrupt(pending.oid, "tree too deep"));
            }
            let node = io.read_node(self, pending.oid)?;
            node.check_bitmaps()?;
            if node.is_root() != (pending.depth == 0) {
                return Err(corrupt(pending.oid, "misplaced root flag"));
            }
            if let Some(level) = pending.level {
                if node.level() != level {
                    return Err(corrupt(pending.oid, "wrong level"));
                }
            } else {
                stats.height = node.level() + 1;
            }
            if node.record_count() == 0 && !node.is_root() {
                return Err(corrupt(pending.oid, "empty node"));
            }
            if let Some(separator) = &pending.separator {
                if node.key(0) != &separator[..] {
                    return Err(corrupt(pending.oid, "separator does not match first key"));
                }
            }

            for i in 1..node.record_count() {
                let prev = self.kind.decode_key(node.key(i - 1))?;
                let this = self.kind.decode_key(node.key(i))?.to_key();
                if compare(&prev, &this, false, false) != Ordering::Less {
                    return Err(corrupt(pending.oid, "keys out of order"));
                }
            }

            stats.node_count += 1;
            visit(&node)?;

            if node.is_leaf() {
                for i in 0..node.record_count() {
                    let key = node.key(i);
                    let key_ref = self.kind.decode_key(key)?;
                    if let Some(last) = &last_key {
                        let last = self.kind.decode_key(last)?;
                        if compare(&last, &key_ref.to_key(), false, false) != Ordering::Less {
                            return Err(corrupt(pending.oid, "keys out of order across leaves"));
                        }
                    }
                    stats.key_count += 1;
                    stats.longest_key = stats.longest_key.max(key.len() as u32);
                    stats.longest_val = stats.longest_val.max(node.value(i).len() as u32);
                    if i + 1 == node.record_count() {
                        last_key = Some(key.to_vec());
                    }
                }
                continue;
            }

            // Children are pushed in reverse so that they pop in key order.
            for i in (0..node.record_count()).rev() {
                stack.push(Pending {
                    oid: node.child_oid(i)?,
                    level: Some(node.level() - 1),
                    separator: Some(node.key(i).to_vec()),
                    depth: pending.depth + 1,
                });
            }
        }
        Ok(stats)
    }
}
