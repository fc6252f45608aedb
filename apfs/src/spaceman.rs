//! Space manager: the block allocation bitmap and the free queues.
//!
//! Block 1 holds the space manager object. The raw allocation bitmap follows it, one block
//! per chunk of `block_size * 8` blocks, with a set bit for every block in use.
//!
//! The space manager object layout:
//!
//! ```rust,ignore
//! obj: ObjPhys                   // 32 bytes
//! block_size: u32
//! blocks_per_chunk: u32
//! chunks_per_cib: u32
//! cibs_per_cab: u32
//! block_count: u64
//! chunk_count: u64
//! cib_count: u32
//! cab_count: u32
//! free_count: u64
//! bitmap_base: u64
//! bitmap_blocks: u64
//! fq: [{ count: u64, tree_oid: u64, oldest_xid: u64 }; 2]
//! ```

use apfs_core::key::read_pair_key;
use apfs_core::records::decode_fq_value;
use bitvec::prelude::*;

use crate::btree::{Btree, BtreeKind};
use crate::error::{Error, Result};

pub type Bitmap = BitVec<u8, Lsb0>;

/// Block holding the space manager object.
pub const SPACEMAN_BLOCK: u64 = 1;

/// Free queue of the internal pool. Nothing is ever queued there.
pub const SFQ_IP: usize = 0;
/// Free queue of the main device.
pub const SFQ_MAIN: usize = 1;

const FQ_OFFSET: usize = 96;
const FQ_SIZE: usize = 24;
const SPACEMAN_SIZE: usize = FQ_OFFSET + 2 * FQ_SIZE;

/// A free queue: blocks freed at some transaction and not reusable yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeQueue {
    /// Number of blocks in the queue.
    pub count: u64,
    pub tree: Btree,
    /// Transaction of the oldest entry, zero when the queue is empty.
    pub oldest_xid: u64,
}

impl FreeQueue {
    fn new(tree_oid: u64) -> Self {
        FreeQueue {
            count: 0,
            tree: Btree {
                kind: BtreeKind::FreeQueue,
                root: tree_oid,
                stats: Default::default(),
            },
            oldest_xid: 0,
        }
    }
}

/// Running totals of a free queue walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeQueueTotals {
    pub count: u64,
    pub oldest_xid: u64,
}

/// One decoded free queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeQueueEntry {
    pub xid: u64,
    pub paddr: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spaceman {
    pub block_size: u32,
    pub blocks_per_chunk: u32,
    pub chunks_per_cib: u32,
    pub cibs_per_cab: u32,
    pub block_count: u64,
    pub chunk_count: u64,
    pub cib_count: u32,
    pub cab_count: u32,
    pub free_count: u64,
    pub bitmap_base: u64,
    pub bitmap_blocks: u64,
    pub bitmap: Bitmap,
    pub fq: [FreeQueue; 2],
    /// Where the next allocation search starts.
    hint: u64,
}

impl Spaceman {
    /// Computes the layout for a new container. Blocks up to the end of the bitmap are
    /// marked in use.
    pub fn layout(block_size: usize, block_count: u64) -> Self {
        let blocks_per_chunk = block_size as u32 * 8;
        let chunk_count = block_count.div_ceil(blocks_per_chunk as u64);
        let chunks_per_cib = (block_size as u32 - 40) / 32;
        let cibs_per_cab = (block_size as u32 - 40) / 8;
        let cib_count = chunk_count.div_ceil(chunks_per_cib as u64) as u32;
        let cab_count = if cib_count > cibs_per_cab {
            cib_count.div_ceil(cibs_per_cab)
        } else {
            0
        };
        let bitmap_base = SPACEMAN_BLOCK + 1;
        let bitmap_blocks = chunk_count;

        let mut sm = Spaceman {
            block_size: block_size as u32,
            blocks_per_chunk,
            chunks_per_cib,
            cibs_per_cab,
            block_count,
            chunk_count,
            cib_count,
            cab_count,
            free_count: block_count,
            bitmap_base,
            bitmap_blocks,
            bitmap: bitvec![u8, Lsb0; 0; block_count as usize],
            fq: [FreeQueue::new(0), FreeQueue::new(0)],
            hint: 0,
        };
        let reserved = sm.reserved_blocks();
        sm.bitmap[..reserved as usize].fill(true);
        sm.free_count -= reserved;
        sm.hint = reserved;
        sm
    }

    /// Blocks taken by the superblock, the space manager and the bitmap.
    pub fn reserved_blocks(&self) -> u64 {
        self.bitmap_base + self.bitmap_blocks
    }

    /// Decodes the space manager object. The bitmap is left empty, see [`Self::load_bitmap`].
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < SPACEMAN_SIZE {
            return Err(Error::corrupted("space manager object too small"));
        }
        let le32 = |at: usize| apfs_core::le32(block, at);
        let le64 = |at: usize| apfs_core::le64(block, at);
        let fq = |i: usize| {
            let at = FQ_OFFSET + i * FQ_SIZE;
            let mut fq = FreeQueue::new(le64(at + 8));
            fq.count = le64(at);
            fq.oldest_xid = le64(at + 16);
            fq
        };

        let sm = Spaceman {
            block_size: le32(32),
            blocks_per_chunk: le32(36),
            chunks_per_cib: le32(40),
            cibs_per_cab: le32(44),
            block_count: le64(48),
            chunk_count: le64(56),
            cib_count: le32(64),
            cab_count: le32(68),
            free_count: le64(72),
            bitmap_base: le64(80),
            bitmap_blocks: le64(88),
            bitmap: Bitmap::new(),
            fq: [fq(SFQ_IP), fq(SFQ_MAIN)],
            hint: 0,
        };

        if sm.block_size as usize != block.len()
            || sm.blocks_per_chunk != sm.block_size * 8
            || sm.chunk_count != sm.block_count.div_ceil(sm.blocks_per_chunk as u64)
            || sm.bitmap_blocks != sm.chunk_count
            || sm.free_count > sm.block_count
        {
            return Err(Error::corrupted("inconsistent space manager geometry"));
        }
        if sm.reserved_blocks() > sm.block_count {
            return Err(Error::corrupted("space manager bitmap out of range"));
        }
        Ok(sm)
    }

    /// Fills the bitmap from its on-disk blocks, in order.
    pub fn load_bitmap<'a>(&mut self, blocks: impl Iterator<Item = &'a [u8]>) -> Result<()> {
        let mut bitmap = Bitmap::with_capacity(self.block_count as usize);
        for block in blocks {
            bitmap.extend_from_raw_slice(block);
        }
        if bitmap.len() < self.block_count as usize {
            return Err(Error::corrupted("space manager bitmap too short"));
        }
        bitmap.truncate(self.block_count as usize);
        let free = bitmap.count_zeros() as u64;
        if free != self.free_count {
            return Err(Error::corrupted(format!(
                "space manager counts {} free blocks, bitmap has {free}",
                self.free_count
            )));
        }
        self.bitmap = bitmap;
        self.hint = self.reserved_blocks();
        Ok(())
    }

    /// Encodes the space manager object into `block`. The object header is left alone.
    pub fn encode_to(&self, block: &mut [u8]) {
        let mut put = |at: usize, raw: &[u8]| block[at..at + raw.len()].copy_from_slice(raw);
        put(32, &self.block_size.to_le_bytes());
        put(36, &self.blocks_per_chunk.to_le_bytes());
        put(40, &self.chunks_per_cib.to_le_bytes());
        put(44, &self.cibs_per_cab.to_le_bytes());
        put(48, &self.block_count.to_le_bytes());
        put(56, &self.chunk_count.to_le_bytes());
        put(64, &self.cib_count.to_le_bytes());
        put(68, &self.cab_count.to_le_bytes());
        put(72, &self.free_count.to_le_bytes());
        put(80, &self.bitmap_base.to_le_bytes());
        put(88, &self.bitmap_blocks.to_le_bytes());
        for (i, fq) in self.fq.iter().enumerate() {
            let at = FQ_OFFSET + i * FQ_SIZE;
            put(at, &fq.count.to_le_bytes());
            put(at + 8, &fq.tree.root.to_le_bytes());
            put(at + 16, &fq.oldest_xid.to_le_bytes());
        }
    }

    /// The raw bitmap, cut in block-sized pieces.
    pub fn bitmap_blocks(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        let raw = self.bitmap.as_raw_slice();
        let block_size = self.block_size as usize;
        (0..self.bitmap_blocks as usize).map(move |i| {
            let mut block = vec![0u8; block_size];
            let start = (i * block_size).min(raw.len());
            let end = ((i + 1) * block_size).min(raw.len());
            block[..end - start].copy_from_slice(&raw[start..end]);
            block
        })
    }

    /// Allocates one block.
    pub fn alloc(&mut self) -> Result<u64> {
        let start = self.hint as usize;
        let found = self.bitmap[start..]
            .first_zero()
            .map(|i| i + start)
            .or_else(|| self.bitmap[..start].first_zero());
        let Some(bno) = found else {
            return Err(Error::NoSpace);
        };
        self.bitmap.set(bno, true);
        self.free_count -= 1;
        self.hint = bno as u64 + 1;
        Ok(bno as u64)
    }

    /// Returns a block to the bitmap right away.
    pub fn free_now(&mut self, bno: u64) -> Result<()> {
        if bno < self.reserved_blocks() || bno >= self.block_count {
            return Err(Error::corrupted(format!("freeing reserved or invalid block 0x{bno:x}")));
        }
        if !self.bitmap[bno as usize] {
            return Err(Error::corrupted(format!("double free of block 0x{bno:x}")));
        }
        self.bitmap.set(bno as usize, false);
        self.free_count += 1;
        Ok(())
    }

    pub fn is_allocated(&self, bno: u64) -> bool {
        self.bitmap.get(bno as usize).is_some_and(|bit| *bit)
    }

    /// Records in `used` that `len` blocks at `paddr` are referenced.
    ///
    /// A block referenced twice, or referenced while the bitmap says it is free, is
    /// corruption.
    pub fn mark_used(&self, used: &mut Bitmap, paddr: u64, len: u64) -> Result<()> {
        if used.len() != self.block_count as usize {
            used.resize(self.block_count as usize, false);
        }
        let end = paddr
            .checked_add(len)
            .filter(|&end| end <= self.block_count)
            .ok_or_else(|| {
                Error::corrupted(format!("extent 0x{paddr:x}+{len} is out of range"))
            })?;
        for bno in paddr..end {
            if used[bno as usize] {
                return Err(Error::corrupted(format!("block 0x{bno:x} is used twice")));
            }
            if !self.bitmap[bno as usize] {
                return Err(Error::corrupted(format!(
                    "block 0x{bno:x} is in use but marked free"
                )));
            }
            used.set(bno as usize, true);
        }
        Ok(())
    }

    /// Blocks allocated in the bitmap that were never marked in `used`.
    pub fn leaked(&self, used: &Bitmap) -> Vec<u64> {
        self.bitmap
            .iter_ones()
            .filter(|&bno| !used.get(bno).is_some_and(|bit| *bit))
            .map(|bno| bno as u64)
            .collect()
    }

    /// Decodes one free queue record and adds it to `totals`.
    pub fn parse_free_queue_record(
        &self,
        key: &[u8],
        val: &[u8],
        totals: &mut FreeQueueTotals,
    ) -> Result<FreeQueueEntry> {
        if key.len() != 16 {
            return Err(Error::corrupted(format!(
                "free queue key of {} bytes",
                key.len()
            )));
        }
        let key = read_pair_key(key)?;
        let count = decode_fq_value(val)?;
        if count == 0 {
            return Err(Error::corrupted("empty free queue entry"));
        }
        let entry = FreeQueueEntry {
            xid: key.id,
            paddr: key.number,
            count,
        };
        if entry
            .paddr
            .checked_add(count)
            .map_or(true, |end| end > self.block_count)
        {
            return Err(Error::corrupted(format!(
                "free queue entry 0x{:x}+{count} out of range",
                entry.paddr
            )));
        }
        totals.count += count;
        if totals.oldest_xid == 0 || entry.xid < totals.oldest_xid {
            totals.oldest_xid = entry.xid;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apfs_core::key::pair_key;
    use apfs_core::records::build_fq_value;

    #[test]
    fn layout_reserves_the_metadata_blocks() {
        let sm = Spaceman::layout(4096, 32768);
        assert_eq!(sm.blocks_per_chunk, 32768);
        assert_eq!(sm.chunk_count, 1);
        assert_eq!(sm.bitmap_blocks, 1);
        assert_eq!(sm.chunks_per_cib, (4096 - 40) / 32);
        assert_eq!(sm.reserved_blocks(), 3);
        assert_eq!(sm.free_count, 32768 - 3);
        assert!(sm.is_allocated(2));
        assert!(!sm.is_allocated(3));
    }

    #[test]
    fn alloc_and_free() {
        let mut sm = Spaceman::layout(4096, 100);
        let a = sm.alloc().unwrap();
        let b = sm.alloc().unwrap();
        assert_eq!((a, b), (3, 4));
        sm.free_now(a).unwrap();
        assert!(matches!(sm.free_now(a), Err(Error::FsCorrupted(_))));
        assert!(sm.free_now(1).is_err());

        // Allocation wraps around to reuse freed blocks.
        while sm.free_count > 0 {
            sm.alloc().unwrap();
        }
        assert!(sm.is_allocated(a));
        assert!(matches!(sm.alloc(), Err(Error::NoSpace)));
    }

    #[test]
    fn encode_decode_with_bitmap() {
        let mut sm = Spaceman::layout(4096, 70000);
        for _ in 0..10 {
            sm.alloc().unwrap();
        }
        sm.fq[SFQ_MAIN].count = 4;
        sm.fq[SFQ_MAIN].oldest_xid = 9;
        sm.fq[SFQ_MAIN].tree.root = 77;

        let mut block = vec![0u8; 4096];
        sm.encode_to(&mut block);
        let blocks: Vec<_> = sm.bitmap_blocks().collect();
        assert_eq!(blocks.len(), 3);

        let mut decoded = Spaceman::decode(&block).unwrap();
        decoded
            .load_bitmap(blocks.iter().map(|b| &b[..]))
            .unwrap();
        assert_eq!(decoded.bitmap, sm.bitmap);
        assert_eq!(decoded.fq, sm.fq);
        assert_eq!(decoded.free_count, sm.free_count);

        let mut broken = decoded.clone();
        broken.free_count += 1;
        assert!(broken.load_bitmap(blocks.iter().map(|b| &b[..])).is_err());
    }

    #[test]
    fn mark_used_detects_double_references() {
        let mut sm = Spaceman::layout(4096, 100);
        let bno = sm.alloc().unwrap();
        let mut used = Bitmap::new();
        sm.mark_used(&mut used, 0, 3).unwrap();
        sm.mark_used(&mut used, bno, 1).unwrap();
        assert!(sm.mark_used(&mut used, bno, 1).is_err());
        assert!(sm.mark_used(&mut used, 50, 1).is_err());
        assert!(sm.mark_used(&mut used, 99, 2).is_err());
        assert!(sm.leaked(&used).is_empty());

        let leaked = sm.alloc().unwrap();
        assert_eq!(sm.leaked(&used), vec![leaked]);
    }

    #[test]
    fn free_queue_records() {
        let sm = Spaceman::layout(4096, 100);
        let mut totals = FreeQueueTotals::default();
        let entry = sm
            .parse_free_queue_record(&pair_key(7, 40), &build_fq_value(2), &mut totals)
            .unwrap();
        assert_eq!(
            entry,
            FreeQueueEntry {
                xid: 7,
                paddr: 40,
                count: 2
            }
        );
        sm.parse_free_queue_record(&pair_key(5, 50), &[], &mut totals)
            .unwrap();
        assert_eq!(
            totals,
            FreeQueueTotals {
                count: 3,
                oldest_xid: 5
            }
        );

        assert!(sm
            .parse_free_queue_record(&pair_key(5, 50), &[1, 2, 3], &mut totals)
            .is_err());
        assert!(sm
            .parse_free_queue_record(&pair_key(5, 99), &build_fq_value(2), &mut totals)
            .is_err());
        assert!(sm
            .parse_free_queue_record(&[0; 12], &build_fq_value(1), &mut totals)
            .is_err());
    }
}
