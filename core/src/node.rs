//! B-tree node layout.
//!
//! Here is the layout of a node block:
//!
//! ```rust,ignore
//! obj: ObjPhys                   // 32 bytes
//! btn_flags: u16
//! btn_level: u16                 // 0 for leaves
//! btn_nkeys: u32
//! btn_table_space: Nloc          // relative to the end of the header
//! btn_free_space: Nloc           // relative to the start of the key area
//! btn_key_free_list: Nloc        // len = free bytes inside the key area
//! btn_val_free_list: Nloc        // len = free bytes inside the value area
//! btn_data: [u8]                 // toc | keys -> | free | <- values | info (root only)
//! ```
//!
//! | hdr | toc | keys ... | ---- free ---- | ... values | btree_info? |
//!
//! Key offsets are measured from the start of the key area. Value offsets are measured
//! backwards from the end of the value area, which is the end of the block, or the start of
//! the [`BtreeInfo`] trailer for root nodes.
//!
//! TOC entries are [`KvLoc`] (8 bytes, explicit lengths) for variable-size trees and
//! [`KvOff`] (4 bytes, lengths implied by the tree) for trees with fixed key and value sizes.

use crate::error::{need, FormatError};
use crate::object::OBJ_PHYS_SIZE;
use crate::{le16, le32, le64};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
pub const BTNODE_MASK: u16 = 0x0007;

/// Start of the table of contents.
pub const BTNODE_DATA_START: usize = OBJ_PHYS_SIZE + 24;

/// Size of the trailer stored at the end of root nodes.
pub const BTREE_INFO_SIZE: usize = 40;

/// The table of contents grows in steps of this many entries.
pub const BTREE_TOC_ENTRY_INCREMENT: usize = 8;

/// Offset value marking an empty free list.
pub const BTOFF_INVALID: u16 = 0xffff;

pub const KVLOC_SIZE: usize = 8;
pub const KVOFF_SIZE: usize = 4;

pub const BTREE_PHYSICAL: u32 = 0x0000_0010;
pub const BTREE_FIXED_KV: u32 = 0x0001_0000;

/// An offset-length pair locating a byte range inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    fn decode(buf: &[u8], at: usize) -> Self {
        Nloc {
            off: le16(buf, at),
            len: le16(buf, at + 2),
        }
    }

    fn encode_to(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 2].copy_from_slice(&self.off.to_le_bytes());
        buf[at + 2..at + 4].copy_from_slice(&self.len.to_le_bytes());
    }
}

/// The fixed part of a node following the object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: Nloc,
    pub free_space: Nloc,
    pub key_free_list: Nloc,
    pub val_free_list: Nloc,
}

impl NodeHeader {
    pub fn decode(block: &[u8]) -> Result<Self, FormatError> {
        need("node header", block, BTNODE_DATA_START)?;
        Ok(NodeHeader {
            flags: le16(block, 32),
            level: le16(block, 34),
            nkeys: le32(block, 36),
            table_space: Nloc::decode(block, 40),
            free_space: Nloc::decode(block, 44),
            key_free_list: Nloc::decode(block, 48),
            val_free_list: Nloc::decode(block, 52),
        })
    }

    pub fn encode_to(&self, block: &mut [u8]) {
        block[32..34].copy_from_slice(&self.flags.to_le_bytes());
        block[34..36].copy_from_slice(&self.level.to_le_bytes());
        block[36..40].copy_from_slice(&self.nkeys.to_le_bytes());
        self.table_space.encode_to(block, 40);
        self.free_space.encode_to(block, 44);
        self.key_free_list.encode_to(block, 48);
        self.val_free_list.encode_to(block, 52);
    }
}

/// Static description and statistics of a tree, kept at the end of its root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    /// Zero for variable-size keys.
    pub key_size: u32,
    /// Zero for variable-size values.
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        need("btree info", buf, BTREE_INFO_SIZE)?;
        Ok(BtreeInfo {
            flags: le32(buf, 0),
            node_size: le32(buf, 4),
            key_size: le32(buf, 8),
            val_size: le32(buf, 12),
            longest_key: le32(buf, 16),
            longest_val: le32(buf, 20),
            key_count: le64(buf, 24),
            node_count: le64(buf, 32),
        })
    }

    pub fn encode_to(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), BTREE_INFO_SIZE);
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.node_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.val_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.longest_key.to_le_bytes());
        buf[20..24].copy_from_slice(&self.longest_val.to_le_bytes());
        buf[24..32].copy_from_slice(&self.key_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.node_count.to_le_bytes());
    }
}

/// A table of contents entry with explicit lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KvLoc {
    pub k: Nloc,
    pub v: Nloc,
}

impl KvLoc {
    pub fn decode(buf: &[u8], at: usize) -> Self {
        KvLoc {
            k: Nloc::decode(buf, at),
            v: Nloc::decode(buf, at + 4),
        }
    }

    pub fn encode_to(&self, buf: &mut [u8], at: usize) {
        self.k.encode_to(buf, at);
        self.v.encode_to(buf, at + 4);
    }
}

/// A table of contents entry for fixed-size keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KvOff {
    pub k: u16,
    pub v: u16,
}

impl KvOff {
    pub fn decode(buf: &[u8], at: usize) -> Self {
        KvOff {
            k: le16(buf, at),
            v: le16(buf, at + 2),
        }
    }

    pub fn encode_to(&self, buf: &mut [u8], at: usize) {
        buf[at..at + 2].copy_from_slice(&self.k.to_le_bytes());
        buf[at + 2..at + 4].copy_from_slice(&self.v.to_le_bytes());
    }
}
