//! The object map: versioned translation of virtual oids to physical blocks.

use apfs_core::key::{pair_key, read_pair_key, Key};
use apfs_core::records::{OmapVal, OMAP_VAL_DELETED};

use crate::btree::{Btree, NodeIo, Query, QueryFlags};
use crate::error::Result;

/// One mapping of the object map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapRecord {
    pub oid: u64,
    pub xid: u64,
    pub val: OmapVal,
}

/// Finds the mapping of `oid` visible at transaction `xid`: the one with the greatest
/// transaction id not above `xid`. Deleted mappings hide the object.
pub fn lookup(tree: &Btree, io: &dyn NodeIo, oid: u64, xid: u64) -> Result<Option<OmapRecord>> {
    let mut query = Query::new(Key::omap(oid, xid), QueryFlags::EXACT);
    if !query.run(tree, io)? {
        return Ok(None);
    }
    let key = read_pair_key(query.key_bytes())?;
    let val = OmapVal::decode(query.value())?;
    if val.flags & OMAP_VAL_DELETED != 0 {
        return Ok(None);
    }
    Ok(Some(OmapRecord {
        oid: key.id,
        xid: key.number,
        val,
    }))
}

/// Maps `oid` at transaction `xid` to block `paddr`.
pub fn insert(
    tree: &mut Btree,
    io: &mut dyn NodeIo,
    oid: u64,
    xid: u64,
    paddr: u64,
) -> Result<()> {
    let val = OmapVal {
        flags: 0,
        size: io.block_size() as u32,
        paddr,
    };
    tree.insert(io, &pair_key(oid, xid), &val.encode())
}

pub fn remove(tree: &mut Btree, io: &mut dyn NodeIo, oid: u64, xid: u64) -> Result<()> {
    tree.remove(io, &Key::omap(oid, xid))
}

/// Every mapping in key order.
pub fn records(tree: &Btree, io: &dyn NodeIo) -> Result<Vec<OmapRecord>> {
    let mut query = Query::new(Key::default(), QueryFlags::default());
    let mut out = Vec::with_capacity(tree.stats.key_count as usize);
    let mut more = query.first(tree, io)?;
    while more {
        let key = read_pair_key(query.current_key())?;
        out.push(OmapRecord {
            oid: key.id,
            xid: key.number,
            val: OmapVal::decode(query.current_value())?,
        });
        more = query.step(tree, io)?;
    }
    Ok(out)
}
