//! Consistency checker.
//!
//! [`check`] walks every structure of a container and fails with [`Error::FsCorrupted`] on the
//! first violated invariant. It never repairs anything.

use std::fmt;

use apfs_core::key::{
    read_cat_key, APFS_TYPE_DIR_REC, APFS_TYPE_INODE, APFS_TYPE_SIBLING_LINK,
    APFS_TYPE_SIBLING_MAP,
};
use apfs_core::records::{
    decode_drec, decode_sibling_link, decode_sibling_map, dt_from_mode, Drec, InodeVal,
    OMAP_VAL_DELETED,
};
use apfs_core::Key;
use fxhash::FxHashMap;
use tracing::{debug, error};

use crate::btree::{Btree, BtreeKind, Query, QueryFlags, WalkStats};
use crate::catalog::orphan_name;
use crate::container::{Container, PRIV_DIR_INO, ROOT_DIR_INO, ROOT_DIR_PARENT};
use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::omap::{self, OmapRecord};
use crate::spaceman::{Bitmap, FreeQueueTotals, SFQ_IP, SFQ_MAIN};

/// What a successful check found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub xid: u64,
    /// Every tree with the totals of its walk.
    pub trees: Vec<(BtreeKind, WalkStats)>,
    pub inodes: u64,
    pub directories: u64,
    pub dentries: u64,
    /// Inodes with more than one link.
    pub hard_linked: u64,
    /// Inodes only reachable through the private directory.
    pub orphans: u64,
    /// Blocks waiting in the free queues.
    pub queued_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "xid:           {}", self.xid)?;
        for (kind, stats) in &self.trees {
            writeln!(
                f,
                "{:<14} {} keys, {} nodes, height {}",
                format!("{kind:?}:"),
                stats.key_count,
                stats.node_count,
                stats.height
            )?;
        }
        writeln!(f, "inodes:        {} ({} directories)", self.inodes, self.directories)?;
        writeln!(f, "dentries:      {}", self.dentries)?;
        writeln!(f, "hard linked:   {}", self.hard_linked)?;
        writeln!(f, "orphans:       {}", self.orphans)?;
        writeln!(f, "queued blocks: {}", self.queued_blocks)?;
        write!(f, "blocks:        {} used, {} free", self.used_blocks, self.free_blocks)
    }
}

fn corrupt(detail: String) -> Error {
    error!(%detail, "consistency check failed");
    Error::FsCorrupted(detail)
}

/// Checks the whole container.
pub fn check(fs: &Container) -> Result<CheckReport> {
    let sm = fs.spaceman();
    let mut used = Bitmap::new();
    sm.mark_used(&mut used, 0, sm.reserved_blocks())?;

    let mut report = CheckReport {
        xid: fs.xid(),
        ..Default::default()
    };

    // Structure of every tree, and the blocks their nodes occupy.
    let mut catalog_nodes: FxHashMap<u64, u64> = FxHashMap::default();
    let trees = [
        fs.omap(),
        fs.catalog(),
        fs.extentref(),
        fs.snap_meta(),
        &sm.fq[SFQ_IP].tree,
        &sm.fq[SFQ_MAIN].tree,
    ];
    for tree in trees {
        let stats = tree.walk(fs, &mut |node| {
            sm.mark_used(&mut used, node.object.block_nr, 1)?;
            if tree.kind == BtreeKind::Catalog {
                catalog_nodes.insert(node.object.oid, node.object.block_nr);
            }
            Ok(())
        })?;
        check_stats(tree, &stats)?;
        report.trees.push((tree.kind, stats));
    }

    check_omap(fs, &catalog_nodes)?;
    report.queued_blocks = check_free_queues(fs, &mut used)?;

    let leaked = sm.leaked(&used);
    if let Some(first) = leaked.first() {
        return Err(corrupt(format!(
            "{} allocated blocks are not referenced, first 0x{first:x}",
            leaked.len()
        )));
    }
    let allocated = sm.bitmap.count_ones() as u64;
    if sm.free_count != sm.block_count - allocated {
        return Err(corrupt(format!(
            "free count {} disagrees with the bitmap ({} allocated of {})",
            sm.free_count, allocated, sm.block_count
        )));
    }
    report.used_blocks = allocated;
    report.free_blocks = sm.free_count;

    check_catalog(fs, &mut report)?;
    debug!(xid = report.xid, "consistency check passed");
    Ok(report)
}

fn check_stats(tree: &Btree, walked: &WalkStats) -> Result<()> {
    let stored = &tree.stats;
    if stored.key_count != walked.key_count || stored.node_count != walked.node_count {
        return Err(corrupt(format!(
            "{:?} tree claims {} keys in {} nodes, found {} in {}",
            tree.kind, stored.key_count, stored.node_count, walked.key_count, walked.node_count
        )));
    }
    // The longest lengths only ever grow.
    if stored.longest_key < walked.longest_key || stored.longest_val < walked.longest_val {
        return Err(corrupt(format!(
            "{:?} tree records are longer than its statistics allow",
            tree.kind
        )));
    }
    Ok(())
}

/// Every omap record must map a live catalog node, and every catalog node must be mapped.
fn check_omap(fs: &Container, catalog_nodes: &FxHashMap<u64, u64>) -> Result<()> {
    let mut table: FxHashMap<u64, OmapRecord> = FxHashMap::default();
    for record in omap::records(fs.omap(), fs)? {
        if record.val.flags & OMAP_VAL_DELETED != 0 {
            return Err(corrupt(format!(
                "deleted object map record for oid 0x{:x}",
                record.oid
            )));
        }
        if record.xid > fs.xid() {
            return Err(corrupt(format!(
                "object map record for oid 0x{:x} is from the future (xid {})",
                record.oid, record.xid
            )));
        }
        if let Some(prev) = table.insert(record.oid, record) {
            return Err(corrupt(format!(
                "oid 0x{:x} is mapped at xids {} and {}",
                record.oid, prev.xid, record.xid
            )));
        }
    }

    for (oid, record) in &table {
        match catalog_nodes.get(oid) {
            Some(&bno) if bno == record.val.paddr => {}
            Some(&bno) => {
                return Err(corrupt(format!(
                    "oid 0x{oid:x} mapped to block 0x{:x} but read from 0x{bno:x}",
                    record.val.paddr
                )))
            }
            None => {
                return Err(corrupt(format!(
                    "object map record for oid 0x{oid:x} is not referenced"
                )))
            }
        }
    }
    if table.len() != catalog_nodes.len() {
        return Err(corrupt(format!(
            "{} catalog nodes but {} object map records",
            catalog_nodes.len(),
            table.len()
        )));
    }
    Ok(())
}

/// Checks the free queue totals and marks the queued blocks. Returns the number queued.
fn check_free_queues(fs: &Container, used: &mut Bitmap) -> Result<u64> {
    let sm = fs.spaceman();
    let mut queued = 0;
    for fq in &sm.fq {
        let mut totals = FreeQueueTotals::default();
        let mut query = Query::new(Key::default(), QueryFlags::default());
        let mut more = query.first(&fq.tree, fs)?;
        while more {
            let entry =
                sm.parse_free_queue_record(query.current_key(), query.current_value(), &mut totals)?;
            if entry.xid > fs.xid() {
                return Err(corrupt(format!(
                    "free queue entry 0x{:x} is from the future (xid {})",
                    entry.paddr, entry.xid
                )));
            }
            sm.mark_used(used, entry.paddr, entry.count)?;
            more = query.step(&fq.tree, fs)?;
        }
        if totals.count != fq.count || totals.oldest_xid != fq.oldest_xid {
            return Err(corrupt(format!(
                "free queue claims {} blocks from xid {}, holds {} from xid {}",
                fq.count, fq.oldest_xid, totals.count, totals.oldest_xid
            )));
        }
        queued += totals.count;
    }
    Ok(queued)
}

#[derive(Default)]
struct Catalog {
    inodes: FxHashMap<u64, Inode>,
    /// Dentries by target inode, with their parent.
    dentries: FxHashMap<u64, Vec<(u64, Drec)>>,
    children: FxHashMap<u64, u32>,
    /// Sibling links by (inode, sibling id), with whether a dentry claimed them.
    links: FxHashMap<(u64, u64), (u64, String, bool)>,
    maps: FxHashMap<u64, u64>,
}

fn load_catalog(fs: &Container) -> Result<Catalog> {
    let codec = fs.codec();
    let mut cat = Catalog::default();
    let mut query = Query::new(Key::default(), QueryFlags::default());
    let mut more = query.first(fs.catalog(), fs)?;
    while more {
        let raw_key = query.current_key();
        let raw_val = query.current_value();
        let key = read_cat_key(raw_key)?;
        match key.ty {
            APFS_TYPE_INODE => {
                let inode = Inode::from_val(key.id, InodeVal::decode(raw_val)?)?;
                cat.inodes.insert(key.id, inode);
            }
            APFS_TYPE_DIR_REC => {
                let drec = decode_drec(raw_key, raw_val)?;
                if key.number != codec.hash(&drec.name) as u64 {
                    return Err(corrupt(format!(
                        "dentry {:?} in 0x{:x} has the wrong name hash",
                        drec.name, key.id
                    )));
                }
                *cat.children.entry(key.id).or_default() += 1;
                cat.dentries.entry(drec.ino).or_default().push((key.id, drec));
            }
            APFS_TYPE_SIBLING_LINK => {
                let link = decode_sibling_link(raw_key, raw_val)?;
                cat.links
                    .insert((key.id, link.sibling_id), (link.parent_id, link.name, false));
            }
            APFS_TYPE_SIBLING_MAP => {
                cat.maps.insert(key.id, decode_sibling_map(raw_val)?);
            }
            ty => {
                return Err(corrupt(format!(
                    "unexpected catalog record type {ty} for id 0x{:x}",
                    key.id
                )))
            }
        }
        more = query.step(fs.catalog(), fs)?;
    }
    Ok(cat)
}

fn check_catalog(fs: &Container, report: &mut CheckReport) -> Result<()> {
    let mut cat = load_catalog(fs)?;
    for cnid in [ROOT_DIR_INO, PRIV_DIR_INO] {
        match cat.inodes.get(&cnid) {
            Some(dir) if dir.is_dir() && dir.parent_id == ROOT_DIR_PARENT => {}
            _ => return Err(corrupt(format!("special directory 0x{cnid:x} is missing"))),
        }
    }

    for (ino, dentries) in &cat.dentries {
        for (parent, drec) in dentries {
            match cat.inodes.get(parent) {
                Some(dir) if dir.is_dir() => {}
                _ => {
                    return Err(corrupt(format!(
                        "dentry {:?} lives in 0x{parent:x}, which is not a directory",
                        drec.name
                    )))
                }
            }
            let Some(inode) = cat.inodes.get(ino) else {
                return Err(corrupt(format!(
                    "dentry {:?} in 0x{parent:x} points to missing inode 0x{ino:x}",
                    drec.name
                )));
            };
            if drec.file_type != dt_from_mode(inode.mode) {
                return Err(corrupt(format!(
                    "dentry {:?} in 0x{parent:x} has the wrong file type",
                    drec.name
                )));
            }
            if drec.sibling_id == 0 {
                continue;
            }
            match cat.links.get_mut(&(*ino, drec.sibling_id)) {
                Some((link_parent, link_name, claimed))
                    if *link_parent == *parent && *link_name == drec.name && !*claimed =>
                {
                    *claimed = true;
                }
                _ => {
                    return Err(corrupt(format!(
                        "dentry {:?} in 0x{parent:x} has no matching sibling link 0x{:x}",
                        drec.name, drec.sibling_id
                    )))
                }
            }
            if cat.maps.get(&drec.sibling_id) != Some(ino) {
                return Err(corrupt(format!(
                    "sibling id 0x{:x} of inode 0x{ino:x} has no matching sibling map",
                    drec.sibling_id
                )));
            }
        }
    }
    if let Some(((ino, sibling_id), _)) = cat.links.iter().find(|(_, link)| !link.2) {
        return Err(corrupt(format!(
            "sibling link 0x{sibling_id:x} of inode 0x{ino:x} has no dentry"
        )));
    }
    for (sibling_id, ino) in &cat.maps {
        if !cat.links.contains_key(&(*ino, *sibling_id)) {
            return Err(corrupt(format!(
                "sibling map 0x{sibling_id:x} has no sibling link"
            )));
        }
    }

    let empty = Vec::new();
    for (cnid, inode) in &cat.inodes {
        let dentries = cat.dentries.get(cnid).unwrap_or(&empty);
        if inode.is_dir() {
            report.directories += 1;
            let children = cat.children.get(cnid).copied().unwrap_or(0);
            if inode.nchildren != children {
                return Err(corrupt(format!(
                    "directory 0x{cnid:x} counts {} children, has {children}",
                    inode.nchildren
                )));
            }
        }
        if *cnid == ROOT_DIR_INO || *cnid == PRIV_DIR_INO {
            if !dentries.is_empty() {
                return Err(corrupt(format!("special directory 0x{cnid:x} has a dentry")));
            }
            continue;
        }

        let orphan = inode.parent_id == PRIV_DIR_INO && inode.name == orphan_name(*cnid);
        let expected = if orphan || inode.is_dir() { 1 } else { inode.nlink as usize };
        if dentries.len() != expected {
            return Err(corrupt(format!(
                "inode 0x{cnid:x} has {} dentries, expected {expected}",
                dentries.len()
            )));
        }
        if orphan {
            report.orphans += 1;
            if !inode.is_dir() && inode.nlink != 0 {
                return Err(corrupt(format!("orphan inode 0x{cnid:x} still has links")));
            }
        } else if inode.nlink > 1 {
            report.hard_linked += 1;
            if dentries.iter().any(|(_, drec)| drec.sibling_id == 0) {
                return Err(corrupt(format!(
                    "hard-linked inode 0x{cnid:x} has a dentry without sibling id"
                )));
            }
        }
        let primary = dentries
            .iter()
            .any(|(parent, drec)| *parent == inode.parent_id && drec.name == inode.name);
        if !primary {
            return Err(corrupt(format!(
                "primary link {:?} in 0x{:x} of inode 0x{cnid:x} does not exist",
                inode.name, inode.parent_id
            )));
        }
    }

    report.inodes = cat.inodes.len() as u64;
    report.dentries = cat.dentries.values().map(|d| d.len() as u64).sum();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::options::{FormatParams, Options};
    use apfs_core::records::{build_sibling_map_key, build_sibling_map_value};

    fn format() -> Container {
        let dev = MemDevice::new(4096, 32768);
        Container::format(Box::new(dev), &FormatParams::new(), &Options::new()).unwrap()
    }

    #[test]
    fn fresh_container_is_consistent() {
        let fs = format();
        let report = check(&fs).unwrap();
        assert_eq!(report.inodes, 2);
        assert_eq!(report.directories, 2);
        assert_eq!(report.dentries, 0);
        assert_eq!(report.trees.len(), 6);
        assert_eq!(report.used_blocks + report.free_blocks, 32768);
    }

    #[test]
    fn stray_sibling_map_is_reported() {
        let mut fs = format();
        fs.transaction(|fs| {
            fs.catalog_insert(&build_sibling_map_key(99), &build_sibling_map_value(40))
        })
        .unwrap();
        assert!(matches!(check(&fs), Err(Error::FsCorrupted(_))));
    }

    #[test]
    fn wrong_child_count_is_reported() {
        let mut fs = format();
        fs.transaction(|fs| {
            let mut root = fs.inode(ROOT_DIR_INO)?;
            root.nchildren = 1;
            fs.persist_inode(&root, None)
        })
        .unwrap();
        assert!(matches!(check(&fs), Err(Error::FsCorrupted(_))));
    }
}
