//! Catalog, object map and free queue records.
//!
//! Every `build_*` function produces the exact bytes stored in a node and fails only when the
//! buffer cannot be allocated. Every `decode_*` function validates lengths and terminators and
//! returns owned data, so decoded records never borrow from node buffers.

use crate::error::{buffer, need, FormatError};
use crate::key::{
    cat_header, read_cat_key, APFS_TYPE_DIR_REC, APFS_TYPE_INODE, APFS_TYPE_SIBLING_LINK,
    APFS_TYPE_SIBLING_MAP, J_DREC_HASH_MASK, J_DREC_LEN_MASK,
};
use crate::{le16, le32, le64};

pub const S_IFMT: u16 = 0o170000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFSOCK: u16 = 0o140000;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;
pub const DT_WHT: u8 = 14;

/// Low bits of the drec `flags` field holding the file type.
pub const DREC_TYPE_MASK: u16 = 0x000f;

pub const DREC_EXT_TYPE_SIBLING_ID: u8 = 1;
pub const INO_EXT_TYPE_NAME: u8 = 4;
pub const INO_EXT_TYPE_RDEV: u8 = 14;

pub const XF_DO_NOT_COPY: u8 = 0x01;
pub const XF_SYSTEM_FIELD: u8 = 0x20;

/// Longest name a directory record can describe, NUL excluded.
pub const MAX_NAME_LEN: usize = J_DREC_LEN_MASK as usize - 1;

/// Size of the fixed part of a drec value.
pub const DREC_VAL_SIZE: usize = 18;
/// Size of the fixed part of a sibling link value.
pub const SIBLING_VAL_SIZE: usize = 10;
/// Size of the fixed part of an inode value.
pub const INODE_VAL_SIZE: usize = 92;

pub const OMAP_VAL_SIZE: usize = 16;
pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;

/// Maps a POSIX mode to the directory entry type.
pub fn dt_from_mode(mode: u16) -> u8 {
    ((mode & S_IFMT) >> 12) as u8
}

/// Types with the low bit set are reserved, except for FIFOs.
fn sanitize_type(ty: u8) -> u8 {
    if ty != DT_FIFO && ty & 1 != 0 {
        DT_UNKNOWN
    } else {
        ty
    }
}

fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

/// Builds an extended field blob.
///
/// ```rust,ignore
/// xf_num_exts: u16
/// xf_used_data: u16
/// x_fields: [(x_type: u8, x_flags: u8, x_size: u16); xf_num_exts]
/// data: [u8]   // each field padded to 8 bytes
/// ```
#[derive(Default)]
pub struct XFieldsBuilder<'a> {
    fields: Vec<(u8, u8, &'a [u8])>,
}

impl<'a> XFieldsBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x_type: u8, x_flags: u8, data: &'a [u8]) -> &mut Self {
        self.fields.push((x_type, x_flags, data));
        self
    }

    pub fn len(&self) -> usize {
        if self.fields.is_empty() {
            return 0;
        }
        let used: usize = self.fields.iter().map(|(_, _, d)| pad8(d.len())).sum();
        4 + 4 * self.fields.len() + used
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Appends the blob to `out`. Nothing is written when there are no fields.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        if self.fields.is_empty() {
            return;
        }
        let used: usize = self.fields.iter().map(|(_, _, d)| pad8(d.len())).sum();
        out.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        out.extend_from_slice(&(used as u16).to_le_bytes());
        for (x_type, x_flags, data) in &self.fields {
            out.push(*x_type);
            out.push(*x_flags);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        for (_, _, data) in &self.fields {
            out.extend_from_slice(data);
            out.resize(out.len() + pad8(data.len()) - data.len(), 0);
        }
    }
}

/// Finds the data of the extended field of type `x_type` in `blob`.
///
/// Returns `None` when the field is absent or the blob is malformed.
pub fn find_xfield(blob: &[u8], x_type: u8) -> Option<&[u8]> {
    if blob.len() < 4 {
        return None;
    }
    let count = le16(blob, 0) as usize;
    let table_end = 4 + 4 * count;
    if blob.len() < table_end {
        return None;
    }

    let mut data_off = table_end;
    for i in 0..count {
        let entry = 4 + 4 * i;
        let size = le16(blob, entry + 2) as usize;
        if data_off + size > blob.len() {
            return None;
        }
        if blob[entry] == x_type {
            return Some(&blob[data_off..data_off + size]);
        }
        data_off += pad8(size);
    }
    None
}

/// A directory record, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drec {
    pub name: String,
    pub ino: u64,
    pub date_added: u64,
    pub file_type: u8,
    /// Zero when the entry has no sibling id.
    pub sibling_id: u64,
}

/// Builds the hashed key of a directory record.
///
/// ```rust,ignore
/// obj_id_and_type: u64           // parent cnid, APFS_TYPE_DIR_REC
/// name_len_and_hash: u32         // hash << 10 | (name length + 1)
/// name: [u8]                     // NUL-terminated
/// ```
pub fn build_drec_key(parent: u64, name: &str, hash: u32) -> Result<Vec<u8>, FormatError> {
    let name = name.as_bytes();
    if name.len() > MAX_NAME_LEN {
        return Err(FormatError::Invalid(format!(
            "name of {} bytes does not fit a dentry key",
            name.len()
        )));
    }
    let mut key = buffer(12 + name.len() + 1)?;
    key.extend_from_slice(&cat_header(parent, APFS_TYPE_DIR_REC).to_le_bytes());
    let name_len_and_hash = (hash & J_DREC_HASH_MASK) | (name.len() as u32 + 1);
    key.extend_from_slice(&name_len_and_hash.to_le_bytes());
    key.extend_from_slice(name);
    key.push(0);
    Ok(key)
}

/// Builds the value of a directory record.
///
/// ```rust,ignore
/// file_id: u64
/// date_added: u64
/// flags: u16                     // low 4 bits: file type
/// xfields: [u8]                  // only when sibling_id != 0
/// ```
pub fn build_drec_value(
    ino: u64,
    file_type: u8,
    sibling_id: u64,
    date_added: u64,
) -> Result<Vec<u8>, FormatError> {
    let sibling = sibling_id.to_le_bytes();
    let mut xfields = XFieldsBuilder::new();
    if sibling_id != 0 {
        xfields.push(DREC_EXT_TYPE_SIBLING_ID, 0, &sibling);
    }

    let mut val = buffer(DREC_VAL_SIZE + xfields.len())?;
    val.extend_from_slice(&ino.to_le_bytes());
    val.extend_from_slice(&date_added.to_le_bytes());
    val.extend_from_slice(&(file_type as u16 & DREC_TYPE_MASK).to_le_bytes());
    xfields.write_to(&mut val);
    Ok(val)
}

/// Decodes a directory record from its key and value bytes.
pub fn decode_drec(key: &[u8], val: &[u8]) -> Result<Drec, FormatError> {
    let key = read_cat_key(key)?;
    if key.ty != APFS_TYPE_DIR_REC {
        return Err(FormatError::WrongType {
            what: "dentry",
            found: key.ty,
        });
    }
    // UNWRAP: dentry keys always decode with a name.
    let name = key.name.unwrap();
    let name = std::str::from_utf8(name)
        .map_err(|_| FormatError::BadName { what: "dentry" })?
        .to_owned();

    need("dentry value", val, DREC_VAL_SIZE)?;
    let ino = le64(val, 0);
    let date_added = le64(val, 8);
    let file_type = sanitize_type((le16(val, 16) & DREC_TYPE_MASK) as u8);

    let sibling_id = find_xfield(&val[DREC_VAL_SIZE..], DREC_EXT_TYPE_SIBLING_ID)
        .filter(|data| data.len() >= 8)
        .map(|data| le64(data, 0))
        .unwrap_or(0);

    Ok(Drec {
        name,
        ino,
        date_added,
        file_type,
        sibling_id,
    })
}

/// Builds the key of a sibling link record: the inode header followed by the sibling id.
pub fn build_sibling_link_key(ino: u64, sibling_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[0..8].copy_from_slice(&cat_header(ino, APFS_TYPE_SIBLING_LINK).to_le_bytes());
    key[8..16].copy_from_slice(&sibling_id.to_le_bytes());
    key
}

/// Builds the value of a sibling link record.
///
/// ```rust,ignore
/// parent_id: u64
/// name_len: u16                  // including the NUL
/// name: [u8]
/// ```
pub fn build_sibling_link_value(parent: u64, name: &str) -> Result<Vec<u8>, FormatError> {
    let name = name.as_bytes();
    if name.len() > MAX_NAME_LEN {
        return Err(FormatError::Invalid(format!(
            "name of {} bytes does not fit a sibling link",
            name.len()
        )));
    }
    let mut val = buffer(SIBLING_VAL_SIZE + name.len() + 1)?;
    val.extend_from_slice(&parent.to_le_bytes());
    val.extend_from_slice(&(name.len() as u16 + 1).to_le_bytes());
    val.extend_from_slice(name);
    val.push(0);
    Ok(val)
}

/// A sibling link, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingLink {
    pub sibling_id: u64,
    pub parent_id: u64,
    pub name: String,
}

/// Decodes a sibling link record.
pub fn decode_sibling_link(key: &[u8], val: &[u8]) -> Result<SiblingLink, FormatError> {
    let key = read_cat_key(key)?;
    if key.ty != APFS_TYPE_SIBLING_LINK {
        return Err(FormatError::WrongType {
            what: "sibling link",
            found: key.ty,
        });
    }

    need("sibling link value", val, SIBLING_VAL_SIZE)?;
    let parent_id = le64(val, 0);
    let name_len = le16(val, 8) as usize;
    if name_len < 1 {
        return Err(FormatError::NameLength {
            what: "sibling link",
            stored: 0,
            actual: 0,
        });
    }
    if val.len() != SIBLING_VAL_SIZE + name_len {
        return Err(FormatError::NameLength {
            what: "sibling link",
            stored: name_len,
            actual: val.len().saturating_sub(SIBLING_VAL_SIZE),
        });
    }
    let name = &val[SIBLING_VAL_SIZE..];
    if name[name_len - 1] != 0 {
        return Err(FormatError::MissingNul {
            what: "sibling link",
        });
    }
    let name = &name[..name_len - 1];
    if let Some(actual) = name.iter().position(|&b| b == 0) {
        return Err(FormatError::NameLength {
            what: "sibling link",
            stored: name_len - 1,
            actual,
        });
    }
    let name = std::str::from_utf8(name)
        .map_err(|_| FormatError::BadName {
            what: "sibling link",
        })?
        .to_owned();

    Ok(SiblingLink {
        sibling_id: key.number,
        parent_id,
        name,
    })
}

/// Builds the key of a sibling map record, which is just a header keyed by the sibling id.
pub fn build_sibling_map_key(sibling_id: u64) -> [u8; 8] {
    cat_header(sibling_id, APFS_TYPE_SIBLING_MAP).to_le_bytes()
}

pub fn build_sibling_map_value(ino: u64) -> [u8; 8] {
    ino.to_le_bytes()
}

/// Decodes a sibling map value into the cnid of the inode owning the sibling id.
pub fn decode_sibling_map(val: &[u8]) -> Result<u64, FormatError> {
    if val.len() != 8 {
        return Err(FormatError::Truncated {
            what: "sibling map value",
            expected: 8,
            found: val.len(),
        });
    }
    Ok(le64(val, 0))
}

pub fn build_inode_key(cnid: u64) -> [u8; 8] {
    cat_header(cnid, APFS_TYPE_INODE).to_le_bytes()
}

/// The stored part of an inode.
///
/// `nchildren_or_nlink` is the child count for directories and the link count for every
/// other file type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: u64,
    pub mod_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub bsd_flags: u32,
    pub owner: u32,
    pub group: u32,
    pub mode: u16,
    /// Primary link name, stored as the `NAME` extended field.
    pub name: String,
    /// Device number for special files, stored as the `RDEV` extended field when nonzero.
    pub rdev: u32,
}

impl InodeVal {
    /// ```rust,ignore
    /// parent_id: u64
    /// private_id: u64
    /// create_time, mod_time, change_time, access_time: u64
    /// internal_flags: u64
    /// nchildren_or_nlink: i32
    /// default_protection_class: u32
    /// write_generation_counter: u32
    /// bsd_flags: u32
    /// owner: u32
    /// group: u32
    /// mode: u16
    /// pad1: u16
    /// uncompressed_size: u64
    /// xfields: [u8]
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(FormatError::Invalid(format!(
                "inode name of {} bytes is too long",
                self.name.len()
            )));
        }
        let mut name = buffer(self.name.len() + 1)?;
        name.extend_from_slice(self.name.as_bytes());
        name.push(0);
        let rdev = self.rdev.to_le_bytes();

        let mut xfields = XFieldsBuilder::new();
        xfields.push(INO_EXT_TYPE_NAME, XF_DO_NOT_COPY, &name);
        if self.rdev != 0 {
            xfields.push(INO_EXT_TYPE_RDEV, 0, &rdev);
        }

        let mut val = buffer(INODE_VAL_SIZE + xfields.len())?;
        val.extend_from_slice(&self.parent_id.to_le_bytes());
        val.extend_from_slice(&self.private_id.to_le_bytes());
        val.extend_from_slice(&self.create_time.to_le_bytes());
        val.extend_from_slice(&self.mod_time.to_le_bytes());
        val.extend_from_slice(&self.change_time.to_le_bytes());
        val.extend_from_slice(&self.access_time.to_le_bytes());
        val.extend_from_slice(&self.internal_flags.to_le_bytes());
        val.extend_from_slice(&self.nchildren_or_nlink.to_le_bytes());
        val.extend_from_slice(&0u32.to_le_bytes());
        val.extend_from_slice(&0u32.to_le_bytes());
        val.extend_from_slice(&self.bsd_flags.to_le_bytes());
        val.extend_from_slice(&self.owner.to_le_bytes());
        val.extend_from_slice(&self.group.to_le_bytes());
        val.extend_from_slice(&self.mode.to_le_bytes());
        val.extend_from_slice(&0u16.to_le_bytes());
        val.extend_from_slice(&0u64.to_le_bytes());
        xfields.write_to(&mut val);
        Ok(val)
    }

    pub fn decode(val: &[u8]) -> Result<Self, FormatError> {
        need("inode value", val, INODE_VAL_SIZE)?;
        let xfields = &val[INODE_VAL_SIZE..];

        let name = match find_xfield(xfields, INO_EXT_TYPE_NAME) {
            Some(raw) => {
                let raw = match raw.iter().position(|&b| b == 0) {
                    Some(end) => &raw[..end],
                    None => return Err(FormatError::MissingNul { what: "inode name" }),
                };
                std::str::from_utf8(raw)
                    .map_err(|_| FormatError::BadName { what: "inode name" })?
                    .to_owned()
            }
            None => String::new(),
        };
        let rdev = find_xfield(xfields, INO_EXT_TYPE_RDEV)
            .filter(|data| data.len() >= 4)
            .map(|data| le32(data, 0))
            .unwrap_or(0);

        Ok(InodeVal {
            parent_id: le64(val, 0),
            private_id: le64(val, 8),
            create_time: le64(val, 16),
            mod_time: le64(val, 24),
            change_time: le64(val, 32),
            access_time: le64(val, 40),
            internal_flags: le64(val, 48),
            nchildren_or_nlink: le32(val, 56) as i32,
            bsd_flags: le32(val, 68),
            owner: le32(val, 72),
            group: le32(val, 76),
            mode: le16(val, 80),
            name,
            rdev,
        })
    }
}

/// An object map value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

impl OmapVal {
    pub fn encode(&self) -> [u8; OMAP_VAL_SIZE] {
        let mut raw = [0u8; OMAP_VAL_SIZE];
        raw[0..4].copy_from_slice(&self.flags.to_le_bytes());
        raw[4..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..16].copy_from_slice(&self.paddr.to_le_bytes());
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Self, FormatError> {
        if raw.len() != OMAP_VAL_SIZE {
            return Err(FormatError::Truncated {
                what: "omap value",
                expected: OMAP_VAL_SIZE,
                found: raw.len(),
            });
        }
        Ok(OmapVal {
            flags: le32(raw, 0),
            size: le32(raw, 4),
            paddr: le64(raw, 8),
        })
    }
}

/// Encodes the block count of a free queue entry.
pub fn build_fq_value(count: u64) -> [u8; 8] {
    count.to_le_bytes()
}

/// Decodes the block count of a free queue entry. Entries without a value free one block.
pub fn decode_fq_value(val: &[u8]) -> Result<u64, FormatError> {
    match val.len() {
        0 => Ok(1),
        8 => Ok(le64(val, 0)),
        found => Err(FormatError::Truncated {
            what: "free queue value",
            expected: 8,
            found,
        }),
    }
}
