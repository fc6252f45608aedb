//! Insertion and removal.
//!
//! Every change is expressed as a splice on a leaf: a range of records replaced by a list of
//! new records. The leaf is edited in place when the result fits, and split otherwise. The
//! effect on the leaf (gone, same, or replaced by several nodes) becomes a splice on the
//! parent entry, and so on up to the root. Separators in internal nodes are always the first
//! key of the child they point to.

use apfs_core::key::Key;
use tracing::debug;

use super::node::{FixedKv, NodeFull};
use super::query::Frame;
use super::{Btree, Node, NodeIo, Query};
use crate::error::{Error, Result};
use crate::metrics::Metric;

type Record = (Vec<u8>, Vec<u8>);

struct Splice {
    start: usize,
    remove: usize,
    insert: Vec<Record>,
}

fn oversized(_: NodeFull) -> Error {
    Error::corrupted("record larger than a node")
}

/// Applies `splice` to `node` in place. On overflow the node is left partially edited and
/// the full resulting record list is returned instead.
fn apply_in_place(node: &mut Node, splice: &Splice) -> std::result::Result<(), Vec<Record>> {
    for _ in 0..splice.remove {
        node.remove_record(splice.start);
    }
    for (i, (key, val)) in splice.insert.iter().enumerate() {
        if node.insert_record(splice.start + i, key, val).is_err() {
            let at = splice.start + i;
            let mut records = node.records();
            records.splice(at..at, splice.insert[i..].iter().cloned());
            return Err(records);
        }
    }
    Ok(())
}

/// Cuts `records` into runs that each fit in a non-root node, sized as evenly as the record
/// sizes allow.
fn split_records(
    records: &[Record],
    block_size: usize,
    fixed: Option<FixedKv>,
) -> Result<Vec<&[Record]>> {
    let entry = if fixed.is_some() { 4 } else { 8 };
    let size = |r: &Record| r.0.len() + r.1.len() + entry;
    let total: usize = records.iter().map(size).sum();

    for parts in 2..=records.len() {
        let target = total.div_ceil(parts);
        let mut chunks = Vec::with_capacity(parts);
        let (mut start, mut acc) = (0, 0);
        for (i, record) in records.iter().enumerate() {
            if acc > 0 && acc + size(record) > target {
                chunks.push(&records[start..i]);
                start = i;
                acc = 0;
            }
            acc += size(record);
        }
        chunks.push(&records[start..]);
        if chunks
            .iter()
            .all(|chunk| Node::fits(chunk, block_size, false, fixed))
        {
            return Ok(chunks);
        }
    }
    Err(Error::corrupted("record larger than a node"))
}

impl Btree {
    /// Inserts a record. Fails with [`Error::Exists`] if the key is already present.
    pub fn insert(&mut self, io: &mut dyn NodeIo, key: &[u8], val: &[u8]) -> Result<()> {
        let search = self.kind.decode_key(key)?.to_key();
        let mut query = Query::new(search, Default::default());
        if query.seek(self, &*io)? {
            return Err(Error::Exists);
        }
        self.stats.key_count += 1;
        self.stats.longest_key = self.stats.longest_key.max(key.len() as u32);
        self.stats.longest_val = self.stats.longest_val.max(val.len() as u32);

        let path = query.into_frames();
        let start = path.last().map_or(0, |leaf| leaf.index);
        self.splice(
            io,
            path,
            Splice {
                start,
                remove: 0,
                insert: vec![(key.to_vec(), val.to_vec())],
            },
        )
    }

    /// Replaces the value of an existing record.
    pub fn replace(&mut self, io: &mut dyn NodeIo, key: &[u8], val: &[u8]) -> Result<()> {
        let search = self.kind.decode_key(key)?.to_key();
        let mut query = Query::new(search, Default::default());
        if !query.seek(self, &*io)? {
            return Err(Error::NotFound);
        }
        self.stats.longest_val = self.stats.longest_val.max(val.len() as u32);

        let path = query.into_frames();
        let start = path.last().map_or(0, |leaf| leaf.index);
        self.splice(
            io,
            path,
            Splice {
                start,
                remove: 1,
                insert: vec![(key.to_vec(), val.to_vec())],
            },
        )
    }

    /// Removes the record with exactly this key.
    pub fn remove(&mut self, io: &mut dyn NodeIo, key: &Key) -> Result<()> {
        let mut query = Query::new(key.clone(), Default::default());
        if !query.seek(self, &*io)? {
            return Err(Error::NotFound);
        }
        self.remove_found(io, query)
    }

    /// Removes the record a query just matched.
    ///
    /// The query must have run against the current version of this tree.
    pub fn remove_found(&mut self, io: &mut dyn NodeIo, query: Query) -> Result<()> {
        self.stats.key_count = self.stats.key_count.saturating_sub(1);
        let path = query.into_frames();
        let start = path.last().map_or(0, |leaf| leaf.index);
        self.splice(
            io,
            path,
            Splice {
                start,
                remove: 1,
                insert: Vec::new(),
            },
        )
    }

    fn splice(&mut self, io: &mut dyn NodeIo, mut path: Vec<Frame>, mut splice: Splice) -> Result<()> {
        while let Some(frame) = path.pop() {
            let Some(parent) = path.last() else {
                return self.rewrite_root(io, frame.node, splice);
            };
            let separator = parent.node.key(parent.index).to_vec();
            let parent_index = parent.index;
            let oid = frame.node.object.oid;

            let replacement = self.rewrite(io, frame.node, splice)?;
            if let [(first, new_oid)] = &replacement[..] {
                if *first == separator && *new_oid == oid {
                    // Only the statistics in the root trailer are left to update.
                    let root = path.swap_remove(0);
                    return self.rewrite_root(
                        io,
                        root.node,
                        Splice {
                            start: 0,
                            remove: 0,
                            insert: Vec::new(),
                        },
                    );
                }
            }

            splice = Splice {
                start: parent_index,
                remove: 1,
                insert: replacement
                    .into_iter()
                    .map(|(key, oid)| (key, oid.to_le_bytes().to_vec()))
                    .collect(),
            };
        }
        Ok(())
    }

    /// Applies a splice to a non-root node and returns the `(first key, oid)` of every node
    /// now holding its records, which is empty if the node was released.
    fn rewrite(&mut self, io: &mut dyn NodeIo, mut node: Node, splice: Splice) -> Result<Vec<(Vec<u8>, u64)>> {
        let level = node.level();
        let records = match apply_in_place(&mut node, &splice) {
            Ok(()) => {
                if node.record_count() == 0 {
                    io.free_node(self, &node.object)?;
                    self.stats.node_count = self.stats.node_count.saturating_sub(1);
                    return Ok(Vec::new());
                }
                self.write(io, &mut node)?;
                return Ok(vec![(node.key(0).to_vec(), node.object.oid)]);
            }
            Err(records) => records,
        };

        let block_size = io.block_size();
        let fixed = self.kind.fixed();
        let chunks = split_records(&records, block_size, fixed)?;
        io.metrics().count(Metric::NodeSplits);
        debug!(
            kind = ?self.kind,
            oid = node.object.oid,
            level,
            parts = chunks.len(),
            "splitting node"
        );

        let mut out = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i == 0 {
                node.rebuild(chunk, level, false).map_err(oversized)?;
                self.write(io, &mut node)?;
                out.push((chunk[0].0.clone(), node.object.oid));
                continue;
            }
            let object = io.alloc_node(self)?;
            let mut sibling = Node::new(object, block_size, level, false, fixed);
            sibling.rebuild(chunk, level, false).map_err(oversized)?;
            self.write(io, &mut sibling)?;
            self.stats.node_count += 1;
            out.push((chunk[0].0.clone(), sibling.object.oid));
        }
        Ok(out)
    }

    /// Applies a splice to the root. The root keeps its oid: when its records overflow, they
    /// move to new children and the root gains a level.
    fn rewrite_root(&mut self, io: &mut dyn NodeIo, mut root: Node, splice: Splice) -> Result<()> {
        let level = root.level();
        match apply_in_place(&mut root, &splice) {
            Ok(()) => {
                if root.record_count() == 0 && level > 0 {
                    root.rebuild(&[], 0, true).map_err(oversized)?;
                }
                self.write(io, &mut root)
            }
            Err(records) => self.grow_root(io, root, records, level),
        }
    }

    fn grow_root(&mut self, io: &mut dyn NodeIo, mut root: Node, mut records: Vec<Record>, mut level: u16) -> Result<()> {
        let block_size = io.block_size();
        let fixed = self.kind.fixed();
        while !Node::fits(&records, block_size, true, fixed) {
            io.metrics().count(Metric::NodeSplits);
            let mut children = Vec::new();
            for chunk in split_records(&records, block_size, fixed)? {
                let object = io.alloc_node(self)?;
                let mut child = Node::new(object, block_size, level, false, fixed);
                child.rebuild(chunk, level, false).map_err(oversized)?;
                self.write(io, &mut child)?;
                self.stats.node_count += 1;
                children.push((chunk[0].0.clone(), child.object.oid.to_le_bytes().to_vec()));
            }
            records = children;
            level += 1;
            debug!(kind = ?self.kind, level, "tree grew a level");
        }
        root.rebuild(&records, level, true).map_err(oversized)?;
        self.write(io, &mut root)
    }
}
