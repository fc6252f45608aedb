//! Catalog records behind directory entries: dentries, sibling links and sibling maps.
//!
//! A name hash is only 22 bits, so distinct names in one directory may collide. Lookups
//! therefore visit every dentry sharing the hash with [`DentryCandidates`] and compare the
//! full names.

use apfs_core::key::Key;
use apfs_core::records::{
    build_drec_key, build_drec_value, build_sibling_link_key, build_sibling_link_value,
    build_sibling_map_key, build_sibling_map_value, decode_drec, decode_sibling_link,
    decode_sibling_map, dt_from_mode, Drec, SiblingLink,
};
use tracing::{error, warn};

use crate::btree::{Query, QueryFlags};
use crate::container::{Container, PRIV_DIR_INO};
use crate::error::{Error, Result};
use crate::inode::{now_ns, Inode};

/// The dentries of directory `dir` whose names hash like `name`, in key order.
pub struct DentryCandidates<'a> {
    fs: &'a Container,
    dir: u64,
    query: Query,
    done: bool,
}

impl<'a> DentryCandidates<'a> {
    pub fn new(fs: &'a Container, dir: u64, name: &str) -> Self {
        let hash = fs.codec().hash(name);
        let flags = QueryFlags::MULTIPLE | QueryFlags::EXACT | QueryFlags::ANY_NAME;
        DentryCandidates {
            fs,
            dir,
            query: Query::new(Key::drec(dir, Some(name), hash), flags),
            done: false,
        }
    }

    /// The query, positioned on the last candidate returned.
    pub fn into_query(self) -> Query {
        self.query
    }
}

impl Iterator for DentryCandidates<'_> {
    type Item = Result<Drec>;

    fn next(&mut self) -> Option<Result<Drec>> {
        if self.done {
            return None;
        }
        match self.fs.catalog_query(&mut self.query) {
            Ok(true) => {
                let drec = decode_drec(self.query.key_bytes(), self.query.value());
                if drec.is_err() {
                    error!(dir = self.dir, "bad dentry record");
                    self.done = true;
                }
                Some(drec.map_err(Error::from))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Finds the dentry for `name` in `dir`, along with a query positioned on it.
pub fn lookup_dentry(fs: &Container, dir: u64, name: &str) -> Result<(Drec, Query)> {
    let codec = fs.codec();
    let mut candidates = DentryCandidates::new(fs, dir, name);
    while let Some(drec) = candidates.next() {
        let drec = drec?;
        if codec.matches(name, &drec.name) {
            return Ok((drec, candidates.into_query()));
        }
    }
    Err(Error::NotFound)
}

/// Stores the dentry record `dir/name -> inode`.
pub fn create_dentry_rec(
    fs: &mut Container,
    inode: &Inode,
    dir: u64,
    name: &str,
    sibling_id: u64,
) -> Result<()> {
    let key = build_drec_key(dir, name, fs.codec().hash(name))?;
    let val = build_drec_value(inode.cnid, dt_from_mode(inode.mode), sibling_id, now_ns())?;
    fs.catalog_insert(&key, &val)
}

/// Creates the sibling link and sibling map records for a new link of `inode`, returning
/// the sibling id.
pub fn create_sibling_recs(fs: &mut Container, inode: &Inode, dir: u64, name: &str) -> Result<u64> {
    let sibling_id = fs.alloc_obj_id()?;
    let val = build_sibling_link_value(dir, name)?;
    fs.catalog_insert(&build_sibling_link_key(inode.cnid, sibling_id), &val)?;
    fs.catalog_insert(
        &build_sibling_map_key(sibling_id),
        &build_sibling_map_value(inode.cnid),
    )?;
    Ok(sibling_id)
}

/// Deletes the sibling records of a dentry. Both must exist.
pub fn delete_sibling_recs(fs: &mut Container, ino: u64, sibling_id: u64) -> Result<()> {
    let missing = |what: &str| {
        warn!(cnid = ino, sibling_id, "dentry without its {what}");
        Error::corrupted(format!(
            "sibling id 0x{sibling_id:x} of inode 0x{ino:x} has no {what}"
        ))
    };
    match fs.catalog_remove(&Key::sibling_link(ino, sibling_id)) {
        Err(Error::NotFound) => return Err(missing("sibling link")),
        other => other?,
    }
    match fs.catalog_remove(&Key::sibling_map(sibling_id)) {
        Err(Error::NotFound) => Err(missing("sibling map")),
        other => other,
    }
}

/// Every sibling link of inode `ino`, by increasing sibling id.
pub fn sibling_links(fs: &Container, ino: u64) -> Result<Vec<SiblingLink>> {
    let flags = QueryFlags::MULTIPLE | QueryFlags::EXACT | QueryFlags::ANY_NUMBER;
    let mut query = Query::new(Key::sibling_link(ino, 0), flags);
    let mut links = Vec::new();
    while fs.catalog_query(&mut query)? {
        links.push(decode_sibling_link(query.key_bytes(), query.value())?);
    }
    Ok(links)
}

/// The inode owning a sibling id, if the sibling map exists.
pub fn sibling_map_owner(fs: &Container, sibling_id: u64) -> Result<Option<u64>> {
    fs.catalog_get(&Key::sibling_map(sibling_id))?
        .map(|val| decode_sibling_map(&val).map_err(Error::from))
        .transpose()
}

/// The primary link of an inode: the sibling link with the lowest sibling id. Returns the
/// parent and the name.
pub fn find_primary_link(fs: &Container, ino: u64) -> Result<(u64, String)> {
    let links = sibling_links(fs, ino)?;
    match links.into_iter().min_by_key(|link| link.sibling_id) {
        Some(link) => Ok((link.parent_id, link.name)),
        None => {
            warn!(cnid = ino, "linked inode without sibling links");
            Err(Error::corrupted(format!(
                "inode 0x{ino:x} has no sibling links"
            )))
        }
    }
}

/// Name of the link that keeps an unlinked inode reachable from the private directory.
pub fn orphan_name(ino: u64) -> String {
    format!("linux{ino:x}")
}

/// Links an inode whose last link was removed under the private directory. Returns the
/// parent and the name of the new link.
pub fn create_orphan_link(fs: &mut Container, inode: &Inode) -> Result<(u64, String)> {
    let name = orphan_name(inode.cnid);
    create_dentry_rec(fs, inode, PRIV_DIR_INO, &name, 0)?;

    let mut private = fs.inode(PRIV_DIR_INO)?;
    private.touch(now_ns());
    private.nchildren += 1;
    fs.persist_inode(&private, None)?;
    Ok((PRIV_DIR_INO, name))
}

/// Removes the orphan link of inode `ino`.
pub fn delete_orphan_link(fs: &mut Container, ino: u64) -> Result<()> {
    let name = orphan_name(ino);
    let (_, query) = lookup_dentry(fs, PRIV_DIR_INO, &name)?;
    fs.catalog_remove_found(query)?;

    let mut private = fs.inode(PRIV_DIR_INO)?;
    private.touch(now_ns());
    private.nchildren = private.nchildren.checked_sub(1).ok_or_else(|| {
        Error::corrupted("private directory child count underflow")
    })?;
    fs.persist_inode(&private, None)
}
