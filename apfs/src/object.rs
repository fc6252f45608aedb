//! Reading and writing checksummed objects.

use apfs_core::object::{self as raw, ObjPhys};

use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Identity of an object version on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Object {
    /// Physical block holding this version.
    pub block_nr: u64,
    pub oid: u64,
    pub xid: u64,
    /// Object type, without the storage flags.
    pub ty: u32,
    pub subtype: u32,
    /// Storage flags (`OBJ_VIRTUAL`, `OBJ_PHYSICAL`, `OBJ_EPHEMERAL`).
    pub flags: u32,
}

impl Object {
    pub fn header(&self) -> ObjPhys {
        ObjPhys {
            cksum: 0,
            oid: self.oid,
            xid: self.xid,
            type_and_flags: self.ty | self.flags,
            subtype: self.subtype,
        }
    }
}

/// Reads the object stored at `bno`, verifying its checksum.
///
/// `expected_oid` is checked against the header when given.
pub fn read_object(
    dev: &dyn BlockDevice,
    bno: u64,
    expected_oid: Option<u64>,
) -> Result<(Object, Vec<u8>)> {
    let mut block = vec![0u8; dev.block_size()];
    dev.read_block(bno, &mut block)?;
    if !raw::verify(&block) {
        return Err(Error::corrupted(format!(
            "bad checksum for object in block 0x{bno:x}"
        )));
    }

    let hdr = ObjPhys::decode(&block)?;
    if let Some(oid) = expected_oid {
        if hdr.oid != oid {
            return Err(Error::corrupted(format!(
                "block 0x{bno:x} holds object 0x{:x}, expected 0x{oid:x}",
                hdr.oid
            )));
        }
    }

    let object = Object {
        block_nr: bno,
        oid: hdr.oid,
        xid: hdr.xid,
        ty: hdr.object_type(),
        subtype: hdr.subtype,
        flags: hdr.storage(),
    };
    Ok((object, block))
}

/// Stamps the header of `object` on `block`, seals the checksum and writes it.
pub fn write_object(dev: &mut dyn BlockDevice, object: &Object, block: &mut [u8]) -> Result<()> {
    object.header().encode_to(block);
    raw::seal(block);
    dev.write_block(object.block_nr, block)?;
    Ok(())
}
