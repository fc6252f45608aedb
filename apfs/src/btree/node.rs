//! In-memory view of one B-tree node.
//!
//! The node keeps its block buffer and edits it in place. Four bitmaps track byte usage of
//! the key and value areas: `used_*` are derived from the table of contents, `free_*` are
//! their complements and drive span allocation. The value bitmaps are indexed by distance
//! from the end of the value area, so that growing the area appends bits instead of
//! shifting them.

use apfs_core::node::{
    BtreeInfo, KvLoc, KvOff, Nloc, NodeHeader, BTNODE_DATA_START, BTNODE_FIXED_KV_SIZE,
    BTNODE_LEAF, BTNODE_MASK, BTNODE_ROOT, BTOFF_INVALID, BTREE_INFO_SIZE,
    BTREE_TOC_ENTRY_INCREMENT, KVLOC_SIZE, KVOFF_SIZE,
};
use bitvec::prelude::*;

use crate::error::{Error, Result};
use crate::object::Object;

type Bitmap = BitVec<u8, Lsb0>;

/// Key and value sizes of trees whose records all have the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedKv {
    pub key_size: u16,
    /// Value size in leaves. Internal nodes always hold 8-byte child oids.
    pub val_size: u16,
}

/// The two growable areas of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Key,
    Value,
}

/// The edit does not fit in the node, even after reusing free spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFull;

/// Where a span of a given length can be placed.
#[derive(Debug, Clone, Copy)]
struct Span {
    /// Key offset from the start of the key area, or value offset from the end of the node.
    off: usize,
    /// Bytes taken from the central free space.
    grow: usize,
}

#[derive(Clone)]
pub struct Node {
    pub object: Object,
    flags: u16,
    level: u16,
    records: usize,
    fixed: Option<FixedKv>,
    /// Start of the table of contents.
    toc: usize,
    /// Start of the key area, which is also the end of the table of contents.
    key: usize,
    /// Start of the central free space.
    free: usize,
    /// Start of the value area.
    data: usize,
    /// End of the value area.
    end: usize,
    free_key_bmap: Bitmap,
    used_key_bmap: Bitmap,
    free_val_bmap: Bitmap,
    used_val_bmap: Bitmap,
    raw: Vec<u8>,
}

fn toc_capacity_bytes(records: usize, entry_size: usize) -> usize {
    let entries = records.max(1).div_ceil(BTREE_TOC_ENTRY_INCREMENT) * BTREE_TOC_ENTRY_INCREMENT;
    entries * entry_size
}

fn entry_size(fixed: Option<FixedKv>) -> usize {
    if fixed.is_some() {
        KVOFF_SIZE
    } else {
        KVLOC_SIZE
    }
}

/// Length of the run of set bits at the end of `bits`.
fn trailing_ones(bits: &BitSlice<u8, Lsb0>) -> usize {
    bits.len() - bits.last_zero().map_or(0, |i| i + 1)
}

/// Finds the first run of `len` set bits.
fn find_run(bits: &BitSlice<u8, Lsb0>, len: usize) -> Option<usize> {
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, bit) in bits.iter().by_vals().enumerate() {
        if bit {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == len {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }
    None
}

impl Node {
    /// Creates an empty node.
    pub fn new(
        object: Object,
        block_size: usize,
        level: u16,
        root: bool,
        fixed: Option<FixedKv>,
    ) -> Self {
        let mut node = Node {
            object,
            flags: 0,
            level,
            records: 0,
            fixed,
            toc: BTNODE_DATA_START,
            key: 0,
            free: 0,
            data: 0,
            end: 0,
            free_key_bmap: Bitmap::new(),
            used_key_bmap: Bitmap::new(),
            free_val_bmap: Bitmap::new(),
            used_val_bmap: Bitmap::new(),
            raw: vec![0; block_size],
        };
        node.reset(level, root, 0);
        node
    }

    fn reset(&mut self, level: u16, root: bool, capacity: usize) {
        self.level = level;
        self.flags = 0;
        if level == 0 {
            self.flags |= BTNODE_LEAF;
        }
        if root {
            self.flags |= BTNODE_ROOT;
        }
        if self.fixed.is_some() {
            self.flags |= BTNODE_FIXED_KV_SIZE;
        }
        self.records = 0;
        self.end = self.raw.len() - if root { BTREE_INFO_SIZE } else { 0 };
        self.key = self.toc + toc_capacity_bytes(capacity, entry_size(self.fixed));
        self.free = self.key;
        self.data = self.end;
        self.free_key_bmap.clear();
        self.used_key_bmap.clear();
        self.free_val_bmap.clear();
        self.used_val_bmap.clear();
        self.raw[BTNODE_DATA_START..].fill(0);
    }

    /// Decodes and validates a node block.
    pub fn decode(object: Object, raw: Vec<u8>, fixed: Option<FixedKv>) -> Result<Self> {
        let hdr = NodeHeader::decode(&raw)?;
        let corrupt =
            |what: &str| Error::corrupted(format!("node 0x{:x}: {what}", object.oid));

        if hdr.flags & !BTNODE_MASK != 0 {
            return Err(corrupt("unknown flags"));
        }
        if (hdr.flags & BTNODE_LEAF != 0) != (hdr.level == 0) {
            return Err(corrupt("leaf flag does not match level"));
        }
        if (hdr.flags & BTNODE_FIXED_KV_SIZE != 0) != fixed.is_some() {
            return Err(corrupt("wrong key/value layout for the tree"));
        }
        let root = hdr.flags & BTNODE_ROOT != 0;
        let end = raw.len() - if root { BTREE_INFO_SIZE } else { 0 };

        let es = entry_size(fixed);
        let toc_len = hdr.table_space.len as usize;
        if hdr.table_space.off != 0 || toc_len % es != 0 {
            return Err(corrupt("bad table of contents"));
        }
        if hdr.nkeys as usize * es > toc_len {
            return Err(corrupt("table of contents overflow"));
        }
        let toc = BTNODE_DATA_START;
        let key = toc + toc_len;
        let free = key + hdr.free_space.off as usize;
        let data = free + hdr.free_space.len as usize;
        if data > end {
            return Err(corrupt("free space out of bounds"));
        }

        let mut node = Node {
            object,
            flags: hdr.flags,
            level: hdr.level,
            records: hdr.nkeys as usize,
            fixed,
            toc,
            key,
            free,
            data,
            end,
            free_key_bmap: bitvec![u8, Lsb0; 1; free - key],
            used_key_bmap: bitvec![u8, Lsb0; 0; free - key],
            free_val_bmap: bitvec![u8, Lsb0; 1; end - data],
            used_val_bmap: bitvec![u8, Lsb0; 0; end - data],
            raw,
        };

        for i in 0..node.records {
            let (k_off, k_len, v_off, v_len) = node.toc_entry(i);
            if k_len == 0 || k_off + k_len > node.used_key_bmap.len() {
                return Err(corrupt("key out of bounds"));
            }
            if node.used_key_bmap[k_off..k_off + k_len].any() {
                return Err(corrupt("overlapping keys"));
            }
            node.used_key_bmap[k_off..k_off + k_len].fill(true);
            node.free_key_bmap[k_off..k_off + k_len].fill(false);

            if v_len > v_off || v_off > node.used_val_bmap.len() {
                return Err(corrupt("value out of bounds"));
            }
            if node.used_val_bmap[v_off - v_len..v_off].any() {
                return Err(corrupt("overlapping values"));
            }
            node.used_val_bmap[v_off - v_len..v_off].fill(true);
            node.free_val_bmap[v_off - v_len..v_off].fill(false);

            if !node.is_leaf() && v_len != 8 {
                return Err(corrupt("bad child pointer"));
            }
        }

        if node.free_key_bmap.count_ones() != hdr.key_free_list.len as usize {
            return Err(corrupt("key free list does not match the key area"));
        }
        if node.free_val_bmap.count_ones() != hdr.val_free_list.len as usize {
            return Err(corrupt("value free list does not match the value area"));
        }
        Ok(node)
    }

    /// Writes the header, and the tree info for roots, into the buffer and returns it.
    ///
    /// The object header and checksum are left to the object layer.
    pub fn encode(&mut self, info: Option<&BtreeInfo>) -> &mut [u8] {
        let free_list = |bits: &Bitmap| Nloc {
            off: bits.first_one().map_or(BTOFF_INVALID, |i| i as u16),
            len: bits.count_ones() as u16,
        };
        let hdr = NodeHeader {
            flags: self.flags,
            level: self.level,
            nkeys: self.records as u32,
            table_space: Nloc {
                off: 0,
                len: (self.key - self.toc) as u16,
            },
            free_space: Nloc {
                off: (self.free - self.key) as u16,
                len: (self.data - self.free) as u16,
            },
            key_free_list: free_list(&self.free_key_bmap),
            val_free_list: free_list(&self.free_val_bmap),
        };
        hdr.encode_to(&mut self.raw);
        if let (true, Some(info)) = (self.is_root(), info) {
            info.encode_to(&mut self.raw[self.end..self.end + BTREE_INFO_SIZE]);
        }
        &mut self.raw
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn has_fixed_kv_size(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    pub fn level(&self) -> u16 {
        self.level
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn block_size(&self) -> usize {
        self.raw.len()
    }

    /// The tree info stored at the end of a root node.
    pub fn info(&self) -> Result<Option<BtreeInfo>> {
        if !self.is_root() {
            return Ok(None);
        }
        Ok(Some(BtreeInfo::decode(
            &self.raw[self.end..self.end + BTREE_INFO_SIZE],
        )?))
    }

    fn entry_size(&self) -> usize {
        entry_size(self.fixed)
    }

    fn fixed_val_len(&self, fixed: FixedKv) -> usize {
        if self.is_leaf() {
            fixed.val_size as usize
        } else {
            8
        }
    }

    /// Raw table of contents entry: key offset, key length, value offset, value length.
    fn toc_entry(&self, index: usize) -> (usize, usize, usize, usize) {
        let at = self.toc + index * self.entry_size();
        match self.fixed {
            Some(fixed) => {
                let e = KvOff::decode(&self.raw, at);
                (
                    e.k as usize,
                    fixed.key_size as usize,
                    e.v as usize,
                    self.fixed_val_len(fixed),
                )
            }
            None => {
                let e = KvLoc::decode(&self.raw, at);
                (
                    e.k.off as usize,
                    e.k.len as usize,
                    e.v.off as usize,
                    e.v.len as usize,
                )
            }
        }
    }

    fn set_toc_entry(&mut self, index: usize, k_off: usize, k_len: usize, v_off: usize, v_len: usize) {
        let at = self.toc + index * self.entry_size();
        match self.fixed {
            Some(_) => KvOff {
                k: k_off as u16,
                v: v_off as u16,
            }
            .encode_to(&mut self.raw, at),
            None => KvLoc {
                k: Nloc {
                    off: k_off as u16,
                    len: k_len as u16,
                },
                v: Nloc {
                    off: v_off as u16,
                    len: v_len as u16,
                },
            }
            .encode_to(&mut self.raw, at),
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.records {
            return Err(Error::corrupted(format!(
                "record index {index} out of range for node 0x{:x} with {} records",
                self.object.oid, self.records
            )));
        }
        Ok(())
    }

    /// Offset in the block and length of the key of record `index`.
    pub fn key_range(&self, index: usize) -> Result<(usize, usize)> {
        self.check_index(index)?;
        let (k_off, k_len, _, _) = self.toc_entry(index);
        Ok((self.key + k_off, k_len))
    }

    /// Offset in the block and length of the value of record `index`.
    pub fn value_range(&self, index: usize) -> Result<(usize, usize)> {
        self.check_index(index)?;
        let (_, _, v_off, v_len) = self.toc_entry(index);
        Ok((self.end - v_off, v_len))
    }

    /// Key bytes of record `index`, which must be in range.
    pub fn key(&self, index: usize) -> &[u8] {
        let (k_off, k_len, _, _) = self.toc_entry(index);
        &self.raw[self.key + k_off..][..k_len]
    }

    /// Value bytes of record `index`, which must be in range.
    pub fn value(&self, index: usize) -> &[u8] {
        let (_, _, v_off, v_len) = self.toc_entry(index);
        &self.raw[self.end - v_off..][..v_len]
    }

    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.raw[off..off + len]
    }

    /// The oid of the child referenced by record `index` of an internal node.
    pub fn child_oid(&self, index: usize) -> Result<u64> {
        let (off, len) = self.value_range(index)?;
        if len != 8 {
            return Err(Error::corrupted(format!(
                "node 0x{:x}: child pointer of {len} bytes",
                self.object.oid
            )));
        }
        // UNWRAP: length checked above.
        Ok(u64::from_le_bytes(self.raw[off..off + 8].try_into().unwrap()))
    }

    /// Bytes not used by records, counting the central free space and the free spans.
    pub fn free_bytes(&self) -> usize {
        self.data - self.free + self.free_key_bmap.count_ones() + self.free_val_bmap.count_ones()
    }

    /// Looks for room for `len` bytes in `area`, reusing a free span when possible and
    /// otherwise growing the area into the central free space.
    ///
    /// Returns the offset the span would have: from the start of the key area for keys,
    /// from the end of the node for values.
    pub fn find_free_span(&self, area: Area, len: usize) -> std::result::Result<usize, NodeFull> {
        self.plan_span(area, len, self.data - self.free)
            .map(|span| span.off)
    }

    fn plan_span(&self, area: Area, len: usize, central: usize) -> std::result::Result<Span, NodeFull> {
        let bits = match area {
            Area::Key => &self.free_key_bmap,
            Area::Value => &self.free_val_bmap,
        };
        let span_off = |start: usize| match area {
            Area::Key => start,
            Area::Value => start + len,
        };

        if len == 0 {
            return Ok(Span { off: 0, grow: 0 });
        }
        if let Some(start) = find_run(bits, len) {
            return Ok(Span {
                off: span_off(start),
                grow: 0,
            });
        }

        // A free tail of the area can be extended into the central free space.
        let tail = trailing_ones(bits);
        let grow = len - tail;
        if grow > central {
            return Err(NodeFull);
        }
        Ok(Span {
            off: span_off(bits.len() - tail),
            grow,
        })
    }

    fn claim(&mut self, area: Area, span: Span, len: usize) {
        if len == 0 {
            return;
        }
        let (used, free, start) = match area {
            Area::Key => {
                self.free += span.grow;
                (&mut self.used_key_bmap, &mut self.free_key_bmap, span.off)
            }
            Area::Value => {
                self.data -= span.grow;
                (&mut self.used_val_bmap, &mut self.free_val_bmap, span.off - len)
            }
        };
        let new_len = used.len() + span.grow;
        used.resize(new_len, false);
        free.resize(new_len, true);
        used[start..start + len].fill(true);
        free[start..start + len].fill(false);
    }

    fn release(&mut self, area: Area, start: usize, len: usize) {
        let (used, free) = match area {
            Area::Key => (&mut self.used_key_bmap, &mut self.free_key_bmap),
            Area::Value => (&mut self.used_val_bmap, &mut self.free_val_bmap),
        };
        used[start..start + len].fill(false);
        free[start..start + len].fill(true);
    }

    /// Returns free spans at the edges of the key and value areas to the central free space.
    fn trim(&mut self) {
        let tail = trailing_ones(&self.free_key_bmap);
        let len = self.free_key_bmap.len() - tail;
        self.free_key_bmap.truncate(len);
        self.used_key_bmap.truncate(len);
        self.free -= tail;

        let tail = trailing_ones(&self.free_val_bmap);
        let len = self.free_val_bmap.len() - tail;
        self.free_val_bmap.truncate(len);
        self.used_val_bmap.truncate(len);
        self.data += tail;
    }

    /// Moves the key area to make room for more table of contents entries.
    fn grow_toc(&mut self, by: usize) {
        self.raw.copy_within(self.key..self.free, self.key + by);
        self.raw[self.key..self.key + by].fill(0);
        self.key += by;
        self.free += by;
    }

    /// Inserts a record at `index`, shifting the following records up.
    ///
    /// The node is unchanged when the record does not fit.
    pub fn insert_record(
        &mut self,
        index: usize,
        key: &[u8],
        val: &[u8],
    ) -> std::result::Result<(), NodeFull> {
        debug_assert!(index <= self.records);
        if let Some(fixed) = self.fixed {
            debug_assert_eq!(key.len(), fixed.key_size as usize);
            debug_assert_eq!(val.len(), self.fixed_val_len(fixed));
        }

        let es = self.entry_size();
        let toc_grow = if (self.records + 1) * es > self.key - self.toc {
            BTREE_TOC_ENTRY_INCREMENT * es
        } else {
            0
        };
        let central = self.data - self.free;
        if central < toc_grow {
            return Err(NodeFull);
        }
        let k = self.plan_span(Area::Key, key.len(), central - toc_grow)?;
        let v = self.plan_span(Area::Value, val.len(), central - toc_grow - k.grow)?;

        if toc_grow > 0 {
            self.grow_toc(toc_grow);
        }
        self.claim(Area::Key, k, key.len());
        let at = self.key + k.off;
        self.raw[at..at + key.len()].copy_from_slice(key);
        self.claim(Area::Value, v, val.len());
        let at = self.end - v.off;
        self.raw[at..at + val.len()].copy_from_slice(val);

        let toc_at = |i: usize| self.toc + i * es;
        self.raw
            .copy_within(toc_at(index)..toc_at(self.records), toc_at(index + 1));
        self.set_toc_entry(index, k.off, key.len(), v.off, val.len());
        self.records += 1;
        Ok(())
    }

    /// Removes record `index`, which must be in range, and frees its spans.
    pub fn remove_record(&mut self, index: usize) {
        debug_assert!(index < self.records);
        let (k_off, k_len, v_off, v_len) = self.toc_entry(index);
        self.release(Area::Key, k_off, k_len);
        if v_len > 0 {
            self.release(Area::Value, v_off - v_len, v_len);
        }

        let es = self.entry_size();
        let toc_at = |i: usize| self.toc + i * es;
        self.raw
            .copy_within(toc_at(index + 1)..toc_at(self.records), toc_at(index));
        let last = toc_at(self.records - 1);
        self.raw[last..last + es].fill(0);
        self.records -= 1;
        self.trim();
    }

    /// Copies out every record.
    pub fn records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..self.records)
            .map(|i| (self.key(i).to_vec(), self.value(i).to_vec()))
            .collect()
    }

    /// Whether `records` can be laid out in a fresh node.
    pub fn fits(records: &[(Vec<u8>, Vec<u8>)], block_size: usize, root: bool, fixed: Option<FixedKv>) -> bool {
        let toc = toc_capacity_bytes(records.len(), entry_size(fixed));
        let bytes: usize = records.iter().map(|(k, v)| k.len() + v.len()).sum();
        let end = block_size - if root { BTREE_INFO_SIZE } else { 0 };
        BTNODE_DATA_START + toc + bytes <= end
    }

    /// Replaces the contents of the node with `records`, packed without gaps.
    pub fn rebuild(
        &mut self,
        records: &[(Vec<u8>, Vec<u8>)],
        level: u16,
        root: bool,
    ) -> std::result::Result<(), NodeFull> {
        if !Self::fits(records, self.raw.len(), root, self.fixed) {
            return Err(NodeFull);
        }
        self.reset(level, root, records.len());
        for (i, (key, val)) in records.iter().enumerate() {
            self.insert_record(i, key, val)?;
        }
        Ok(())
    }

    /// Checks the node for consistency beyond what decoding guarantees.
    ///
    /// Free and used bitmaps must partition both areas exactly.
    pub fn check_bitmaps(&self) -> Result<()> {
        let partition = |used: &Bitmap, free: &Bitmap| {
            used.len() == free.len() && used.iter().by_vals().zip(free.iter().by_vals()).all(|(u, f)| u != f)
        };
        if !partition(&self.used_key_bmap, &self.free_key_bmap)
            || !partition(&self.used_val_bmap, &self.free_val_bmap)
        {
            return Err(Error::corrupted(format!(
                "node 0x{:x}: free and used bitmaps disagree",
                self.object.oid
            )));
        }
        if self.key > self.free || self.free > self.data || self.data > self.end {
            return Err(Error::corrupted(format!(
                "node 0x{:x}: key and value areas overlap",
                self.object.oid
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> Object {
        Object {
            block_nr: 10,
            oid: 10,
            xid: 1,
            ..Default::default()
        }
    }

    fn kv(i: u32, val_len: usize) -> (Vec<u8>, Vec<u8>) {
        (
            format!("key-{i:05}").into_bytes(),
            vec![i as u8; val_len],
        )
    }

    fn reencode(node: &mut Node, fixed: Option<FixedKv>) -> Node {
        let object = node.object;
        let raw = node.encode(None).to_vec();
        Node::decode(object, raw, fixed).unwrap()
    }

    #[test]
    fn insert_and_read_back() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        for i in (0..20).rev() {
            let (k, v) = kv(i, 10);
            node.insert_record(0, &k, &v).unwrap();
        }
        assert_eq!(node.record_count(), 20);
        for i in 0..20 {
            let (k, v) = kv(i as u32, 10);
            assert_eq!(node.key(i), &k[..]);
            assert_eq!(node.value(i), &v[..]);
        }
        node.check_bitmaps().unwrap();

        let decoded = reencode(&mut node, None);
        assert_eq!(decoded.records(), node.records());
        decoded.check_bitmaps().unwrap();
    }

    #[test]
    fn removal_frees_spans_for_reuse() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        for i in 0..10 {
            let (k, v) = kv(i, 16);
            node.insert_record(i as usize, &k, &v).unwrap();
        }
        let free_before = node.free_bytes();
        node.remove_record(3);
        assert_eq!(node.free_bytes(), free_before + 9 + 16);

        // The freed key span sits inside the area and is reused by a same-size key.
        assert_eq!(node.find_free_span(Area::Key, 9), Ok(3 * 9));
        let (k, v) = kv(3, 16);
        node.insert_record(3, &k, &v).unwrap();
        assert_eq!(node.free_bytes(), free_before);
        node.check_bitmaps().unwrap();

        let decoded = reencode(&mut node, None);
        assert_eq!(decoded.records(), node.records());
    }

    #[test]
    fn removing_the_last_span_shrinks_the_area() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        let (k, v) = kv(1, 8);
        node.insert_record(0, &k, &v).unwrap();
        node.remove_record(0);
        assert_eq!(node.free, node.key);
        assert_eq!(node.data, node.end);
    }

    #[test]
    fn full_node_is_left_untouched() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        let mut i = 0;
        loop {
            let (k, v) = kv(i, 100);
            if node.insert_record(i as usize, &k, &v).is_err() {
                break;
            }
            i += 1;
        }
        assert!(i > 10);
        let before = node.records();
        let (k, v) = kv(i, 100);
        assert_eq!(node.insert_record(0, &k, &v), Err(NodeFull));
        assert_eq!(node.records(), before);
    }

    #[test]
    fn toc_grows_past_the_first_increment() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        for i in 0..(BTREE_TOC_ENTRY_INCREMENT as u32 * 3) {
            let (k, v) = kv(i, 4);
            node.insert_record(i as usize, &k, &v).unwrap();
        }
        for i in 0..(BTREE_TOC_ENTRY_INCREMENT * 3) {
            assert_eq!(node.key(i), &kv(i as u32, 4).0[..]);
        }
        let decoded = reencode(&mut node, None);
        assert_eq!(decoded.records(), node.records());
    }

    #[test]
    fn fixed_size_records() {
        let fixed = Some(FixedKv {
            key_size: 16,
            val_size: 16,
        });
        let mut node = Node::new(object(), 4096, 0, true, fixed);
        for i in 0..50u64 {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&i.to_le_bytes());
            node.insert_record(i as usize, &key, &[i as u8; 16]).unwrap();
        }
        node.remove_record(7);
        let info = BtreeInfo {
            key_count: 49,
            node_count: 1,
            ..Default::default()
        };
        let object = node.object;
        let raw = node.encode(Some(&info)).to_vec();
        let decoded = Node::decode(object, raw, fixed).unwrap();
        assert!(decoded.is_root());
        assert!(decoded.has_fixed_kv_size());
        assert_eq!(decoded.info().unwrap().unwrap().key_count, 49);
        assert_eq!(decoded.record_count(), 49);
        assert_eq!(decoded.value(7), &[8u8; 16]);
    }

    #[test]
    fn ranges_are_checked() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        node.insert_record(0, b"k", b"v").unwrap();
        let (off, len) = node.key_range(0).unwrap();
        assert_eq!(node.bytes(off, len), b"k");
        let (off, len) = node.value_range(0).unwrap();
        assert_eq!(node.bytes(off, len), b"v");
        assert!(matches!(node.key_range(1), Err(Error::FsCorrupted(_))));
        assert!(node.value_range(5).is_err());
    }

    #[test]
    fn rebuild_packs_records() {
        let mut node = Node::new(object(), 4096, 1, false, None);
        let records: Vec<_> = (0..30).map(|i| (vec![i as u8; 12], vec![0u8; 8])).collect();
        node.rebuild(&records, 1, false).unwrap();
        assert!(!node.is_leaf());
        assert_eq!(node.records(), records);
        assert_eq!(node.child_oid(3).unwrap(), 0);

        let too_many: Vec<_> = (0..400).map(|i| (vec![i as u8; 12], vec![0u8; 8])).collect();
        assert!(!Node::fits(&too_many, 4096, false, None));
        assert_eq!(node.rebuild(&too_many, 1, false), Err(NodeFull));
    }

    #[test]
    fn overlapping_keys_are_corruption() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        node.insert_record(0, b"aaaa", b"1").unwrap();
        node.insert_record(1, b"bbbb", b"2").unwrap();
        // Point the second key at the first one.
        node.set_toc_entry(1, 0, 4, 2, 1);
        let object = node.object;
        let raw = node.encode(None).to_vec();
        assert!(matches!(
            Node::decode(object, raw, None),
            Err(Error::FsCorrupted(_))
        ));
    }

    #[test]
    fn leaf_flag_must_match_level() {
        let mut node = Node::new(object(), 4096, 0, false, None);
        node.level = 2;
        let object = node.object;
        let raw = node.encode(None).to_vec();
        assert!(Node::decode(object, raw, None).is_err());
    }
}
