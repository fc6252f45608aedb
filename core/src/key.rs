//! Keys and the ordering of records within a tree.
//!
//! Catalog keys start with a `u64` header holding the object id in the low 60 bits and the
//! record type in the top 4 bits. Records sort by id, then type, then a type-specific suffix:
//! the name hash and name for directory records, the sibling id for sibling links.
//!
//! Object map keys are `(oid, xid)` and free queue keys are `(xid, paddr)`. Both sort
//! numerically and are represented here with the first field as `id` and the second as
//! `number`, which lets a single comparator serve every tree kind.

use std::cmp::Ordering;

use crate::error::{need, FormatError};
use crate::{le16, le32, le64};

pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
pub const OBJ_TYPE_MASK: u64 = 0xf000_0000_0000_0000;
pub const OBJ_TYPE_SHIFT: u32 = 60;

pub const APFS_TYPE_ANY: u8 = 0;
pub const APFS_TYPE_SNAP_METADATA: u8 = 1;
pub const APFS_TYPE_EXTENT: u8 = 2;
pub const APFS_TYPE_INODE: u8 = 3;
pub const APFS_TYPE_XATTR: u8 = 4;
pub const APFS_TYPE_SIBLING_LINK: u8 = 5;
pub const APFS_TYPE_DSTREAM_ID: u8 = 6;
pub const APFS_TYPE_CRYPTO_STATE: u8 = 7;
pub const APFS_TYPE_FILE_EXTENT: u8 = 8;
pub const APFS_TYPE_DIR_REC: u8 = 9;
pub const APFS_TYPE_DIR_STATS: u8 = 10;
pub const APFS_TYPE_SNAP_NAME: u8 = 11;
pub const APFS_TYPE_SIBLING_MAP: u8 = 12;
pub const APFS_TYPE_MAX_VALID: u8 = 12;

/// Low bits of `name_len_and_hash`: name length including the NUL terminator.
pub const J_DREC_LEN_MASK: u32 = 0x0000_03ff;
pub const J_DREC_HASH_MASK: u32 = 0xffff_fc00;
pub const J_DREC_HASH_SHIFT: u32 = 10;

/// Size of the catalog key header.
pub const KEY_HEADER_SIZE: usize = 8;

/// Packs an object id and record type into a catalog key header.
pub fn cat_header(id: u64, ty: u8) -> u64 {
    (id & OBJ_ID_MASK) | ((ty as u64) << OBJ_TYPE_SHIFT)
}

/// Splits a catalog key header into object id and record type.
pub fn split_header(hdr: u64) -> (u64, u8) {
    (hdr & OBJ_ID_MASK, ((hdr & OBJ_TYPE_MASK) >> OBJ_TYPE_SHIFT) as u8)
}

/// An owned search key.
///
/// For directory records `number` holds the hash bits of `name_len_and_hash` (already
/// shifted into place), for sibling links the sibling id, for object map keys the xid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Key {
    pub id: u64,
    pub ty: u8,
    pub number: u64,
    /// Name without the NUL terminator, for record types that carry one.
    pub name: Option<Vec<u8>>,
}

impl Key {
    pub fn omap(oid: u64, xid: u64) -> Self {
        Key {
            id: oid,
            number: xid,
            ..Default::default()
        }
    }

    pub fn free_queue(xid: u64, paddr: u64) -> Self {
        Key {
            id: xid,
            number: paddr,
            ..Default::default()
        }
    }

    pub fn inode(cnid: u64) -> Self {
        Key {
            id: cnid,
            ty: APFS_TYPE_INODE,
            ..Default::default()
        }
    }

    /// A directory record key. `hash` is the masked hash part of `name_len_and_hash`.
    pub fn drec(parent: u64, name: Option<&str>, hash: u32) -> Self {
        Key {
            id: parent,
            ty: APFS_TYPE_DIR_REC,
            number: (hash & J_DREC_HASH_MASK) as u64,
            name: name.map(|n| n.as_bytes().to_vec()),
        }
    }

    pub fn sibling_link(ino: u64, sibling_id: u64) -> Self {
        Key {
            id: ino,
            ty: APFS_TYPE_SIBLING_LINK,
            number: sibling_id,
            ..Default::default()
        }
    }

    pub fn sibling_map(sibling_id: u64) -> Self {
        Key {
            id: sibling_id,
            ty: APFS_TYPE_SIBLING_MAP,
            ..Default::default()
        }
    }

    /// Extent reference trees and snapshot metadata trees are keyed by a plain header.
    pub fn header_only(id: u64, ty: u8) -> Self {
        Key {
            id,
            ty,
            ..Default::default()
        }
    }
}

/// A key decoded in place from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyRef<'a> {
    pub id: u64,
    pub ty: u8,
    pub number: u64,
    pub name: Option<&'a [u8]>,
}

impl KeyRef<'_> {
    pub fn to_key(&self) -> Key {
        Key {
            id: self.id,
            ty: self.ty,
            number: self.number,
            name: self.name.map(|n| n.to_vec()),
        }
    }
}

/// Compares a stored key against a search key.
///
/// `ignore_number` and `ignore_name` make the comparison match on the fixed part of the key
/// only; every stored key sharing that prefix then compares equal.
pub fn compare(stored: &KeyRef, search: &Key, ignore_number: bool, ignore_name: bool) -> Ordering {
    stored
        .id
        .cmp(&search.id)
        .then(stored.ty.cmp(&search.ty))
        .then_with(|| {
            if ignore_number {
                Ordering::Equal
            } else {
                stored.number.cmp(&search.number)
            }
        })
        .then_with(|| {
            if ignore_name {
                return Ordering::Equal;
            }
            match (stored.name, search.name.as_deref()) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            }
        })
}

/// Reads a NUL-terminated name of `len` bytes (terminator included) at `at`.
fn read_name<'a>(what: &'static str, raw: &'a [u8], at: usize, len: usize) -> Result<&'a [u8], FormatError> {
    if len < 1 {
        return Err(FormatError::NameLength {
            what,
            stored: len,
            actual: 0,
        });
    }
    need(what, raw, at + len)?;
    let name = &raw[at..at + len];
    if name[len - 1] != 0 {
        return Err(FormatError::MissingNul { what });
    }
    let name = &name[..len - 1];
    if let Some(actual) = name.iter().position(|&b| b == 0) {
        return Err(FormatError::NameLength {
            what,
            stored: len - 1,
            actual,
        });
    }
    Ok(name)
}

/// Decodes a catalog key.
pub fn read_cat_key(raw: &[u8]) -> Result<KeyRef<'_>, FormatError> {
    need("catalog key", raw, KEY_HEADER_SIZE)?;
    let (id, ty) = split_header(le64(raw, 0));
    let mut key = KeyRef {
        id,
        ty,
        ..Default::default()
    };

    match ty {
        APFS_TYPE_DIR_REC => {
            need("dentry key", raw, 12)?;
            let name_len_and_hash = le32(raw, 8);
            let len = (name_len_and_hash & J_DREC_LEN_MASK) as usize;
            key.number = (name_len_and_hash & J_DREC_HASH_MASK) as u64;
            key.name = Some(read_name("dentry key", raw, 12, len)?);
        }
        APFS_TYPE_XATTR | APFS_TYPE_SNAP_NAME => {
            need("named key", raw, 10)?;
            let len = le16(raw, 8) as usize;
            key.name = Some(read_name("named key", raw, 10, len)?);
        }
        APFS_TYPE_SIBLING_LINK | APFS_TYPE_FILE_EXTENT => {
            need("numbered key", raw, 16)?;
            key.number = le64(raw, 8);
        }
        APFS_TYPE_ANY => {
            return Err(FormatError::WrongType {
                what: "catalog key",
                found: ty,
            })
        }
        _ if ty > APFS_TYPE_MAX_VALID => {
            return Err(FormatError::WrongType {
                what: "catalog key",
                found: ty,
            })
        }
        _ => {}
    }
    Ok(key)
}

/// Decodes a key made of two little-endian `u64` values, as used by object maps and free
/// queues.
pub fn read_pair_key(raw: &[u8]) -> Result<KeyRef<'_>, FormatError> {
    need("fixed key", raw, 16)?;
    Ok(KeyRef {
        id: le64(raw, 0),
        number: le64(raw, 8),
        ..Default::default()
    })
}

/// Encodes a key made of two little-endian `u64` values.
pub fn pair_key(first: u64, second: u64) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0..8].copy_from_slice(&first.to_le_bytes());
    raw[8..16].copy_from_slice(&second.to_le_bytes());
    raw
}

/// Decodes a key consisting of a catalog-style header only.
pub fn read_header_key(raw: &[u8]) -> Result<KeyRef<'_>, FormatError> {
    need("header key", raw, KEY_HEADER_SIZE)?;
    let (id, ty) = split_header(le64(raw, 0));
    Ok(KeyRef {
        id,
        ty,
        ..Default::default()
    })
}
