//! The header shared by every on-disk object and its checksum.
//!
//! ```rust,ignore
//! o_cksum: u64    // Fletcher-64 over bytes [8..block_size)
//! o_oid: u64
//! o_xid: u64
//! o_type: u32     // object type in the low 16 bits, storage class in the top bits
//! o_subtype: u32
//! ```

use crate::error::{need, FormatError};
use crate::{le32, le64};

/// Size of the object header.
pub const OBJ_PHYS_SIZE: usize = 32;

pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x0001;
pub const OBJECT_TYPE_BTREE: u32 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0003;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x0005;
pub const OBJECT_TYPE_SPACEMAN_FREE_QUEUE: u32 = 0x0009;
pub const OBJECT_TYPE_OMAP: u32 = 0x000b;
pub const OBJECT_TYPE_FSTREE: u32 = 0x000e;
pub const OBJECT_TYPE_BLOCKREFTREE: u32 = 0x000f;
pub const OBJECT_TYPE_SNAPMETATREE: u32 = 0x0010;

pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
pub const OBJ_STORAGETYPE_MASK: u32 = 0xc000_0000;
pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;

/// Decoded object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjPhys {
    pub cksum: u64,
    pub oid: u64,
    pub xid: u64,
    /// Object type including the storage class flags.
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl ObjPhys {
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        need("object header", buf, OBJ_PHYS_SIZE)?;
        Ok(ObjPhys {
            cksum: le64(buf, 0),
            oid: le64(buf, 8),
            xid: le64(buf, 16),
            type_and_flags: le32(buf, 24),
            subtype: le32(buf, 28),
        })
    }

    /// Writes everything but the checksum, which is filled by [`seal`].
    pub fn encode_to(&self, buf: &mut [u8]) {
        buf[8..16].copy_from_slice(&self.oid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.xid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.type_and_flags.to_le_bytes());
        buf[28..32].copy_from_slice(&self.subtype.to_le_bytes());
    }

    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    pub fn storage(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGETYPE_MASK
    }
}

/// Computes the Fletcher-64 checksum of an object block, skipping the checksum field itself.
///
/// The block length must be a multiple of 4.
pub fn fletcher64(block: &[u8]) -> u64 {
    const MOD: u64 = 0xffff_ffff;

    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;
    for word in block[8..].chunks_exact(4) {
        sum1 = (sum1 + le32(word, 0) as u64) % MOD;
        sum2 = (sum2 + sum1) % MOD;
    }

    let low = MOD - ((sum1 + sum2) % MOD);
    let high = MOD - ((sum1 + low) % MOD);
    (high << 32) | low
}

/// Stores the checksum of `block` into its header.
pub fn seal(block: &mut [u8]) {
    let cksum = fletcher64(block);
    block[0..8].copy_from_slice(&cksum.to_le_bytes());
}

/// Returns true if the stored checksum matches the contents.
pub fn verify(block: &[u8]) -> bool {
    block.len() >= OBJ_PHYS_SIZE && le64(block, 0) == fletcher64(block)
}
