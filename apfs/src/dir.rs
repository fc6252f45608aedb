//! Directory operations.
//!
//! Every mutating operation here runs inside the transaction its caller opened. When a step
//! fails, the inodes changed by the steps before it are put back in the inode cache, so that
//! the transaction abort that follows leaves memory and disk agreeing with each other.

use apfs_core::key::Key;
use apfs_core::records::{decode_drec, DT_DIR, S_IFDIR, S_IFMT, S_IFREG};
use tracing::{debug, error, warn};

use crate::btree::{Query, QueryFlags};
use crate::catalog::{
    create_dentry_rec, create_orphan_link, create_sibling_recs, delete_orphan_link,
    delete_sibling_recs, find_primary_link, lookup_dentry, orphan_name,
};
use crate::container::{Container, PRIV_DIR_INO, ROOT_DIR_INO};
use crate::error::{Error, Result};
use crate::inode::{now_ns, Inode};

/// Fail if the target name exists.
pub const RENAME_NOREPLACE: u32 = 1 << 0;
/// Swap source and target. Not supported.
pub const RENAME_EXCHANGE: u32 = 1 << 1;
/// Leave a whiteout behind. Not supported.
pub const RENAME_WHITEOUT: u32 = 1 << 2;

/// Longest name, in bytes, of a directory entry.
pub const NAME_MAX: usize = 255;

/// Checks a name given for a new directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidArgument(format!("reserved name {name:?}")));
    }
    if name.contains(['/', '\0']) {
        return Err(Error::InvalidArgument(format!(
            "name {name:?} contains '/' or NUL"
        )));
    }
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

fn require_dir(fs: &mut Container, cnid: u64) -> Result<Inode> {
    let dir = fs.inode(cnid)?;
    if !dir.is_dir() {
        return Err(Error::NotDirectory);
    }
    Ok(dir)
}

fn ensure_absent(fs: &Container, dir: u64, name: &str) -> Result<()> {
    match lookup_dentry(fs, dir, name) {
        Ok(_) => Err(Error::Exists),
        Err(Error::NotFound) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Puts back inodes changed by steps that completed before a failure.
fn restore(fs: &mut Container, saved: Vec<Inode>) {
    for inode in saved.into_iter().rev() {
        fs.cache_inode(inode);
    }
}

/// The cnid that `name` designates in directory `dir`.
pub fn lookup(fs: &Container, dir: u64, name: &str) -> Result<u64> {
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    let (drec, _) = lookup_dentry(fs, dir, name)?;
    Ok(drec.ino)
}

/// Lists directory `dir` starting at `offset`, calling `emit(name, cnid, file type)` for each
/// entry until it returns false. Offsets 0 and 1 are `.` and `..`.
///
/// Returns the offset at which the next call should resume.
pub fn readdir(
    fs: &Container,
    dir: u64,
    offset: u64,
    emit: &mut dyn FnMut(&str, u64, u8) -> bool,
) -> Result<u64> {
    let inode = fs.read_inode(dir)?;
    if !inode.is_dir() {
        return Err(Error::NotDirectory);
    }

    let mut pos = offset;
    if pos == 0 {
        if !emit(".", dir, DT_DIR) {
            return Ok(pos);
        }
        pos = 1;
    }
    if pos == 1 {
        if !emit("..", inode.parent_id, DT_DIR) {
            return Ok(pos);
        }
        pos = 2;
    }

    let mut skip = pos - 2;
    let flags = QueryFlags::MULTIPLE
        | QueryFlags::EXACT
        | QueryFlags::ANY_NAME
        | QueryFlags::ANY_NUMBER;
    let mut query = Query::new(Key::drec(dir, None, 0), flags);
    while fs.catalog_query(&mut query)? {
        if skip > 0 {
            skip -= 1;
            continue;
        }
        let drec = decode_drec(query.key_bytes(), query.value()).map_err(|err| {
            error!(dir, %err, "bad dentry record");
            Error::from(err)
        })?;
        if !emit(&drec.name, drec.ino, drec.file_type) {
            break;
        }
        pos += 1;
    }
    Ok(pos)
}

/// Adds a dentry for `inode` and bumps the parent's child count.
fn create_dentry(fs: &mut Container, dir: u64, name: &str, inode: &Inode) -> Result<()> {
    let sibling_id = if inode.nlink > 1 {
        create_sibling_recs(fs, inode, dir, name)?
    } else {
        0
    };
    create_dentry_rec(fs, inode, dir, name, sibling_id)?;

    // The cached parent only changes once the update is stored.
    let mut parent = fs.inode(dir)?;
    parent.touch(now_ns());
    parent.nchildren += 1;
    fs.persist_inode(&parent, None)
}

/// Creates an inode of type `mode` named `name` in `dir`. Returns its cnid.
pub fn create(fs: &mut Container, dir: u64, name: &str, mode: u16, rdev: u32) -> Result<u64> {
    validate_name(name)?;
    let parent = require_dir(fs, dir)?;
    ensure_absent(fs, dir, name)?;

    let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
    let store = fs.inode_store();
    let mut inode = store.new_inode(fs, &parent, mode, rdev)?;
    inode.parent_id = dir;
    inode.name = name.to_owned();
    store.create_inode_record(fs, &inode)?;
    fs.cache_inode(inode.clone());

    if let Err(err) = create_dentry(fs, dir, name, &inode) {
        fs.forget_inode(inode.cnid);
        return Err(err);
    }
    debug!(cnid = inode.cnid, dir, name, "created inode");
    Ok(inode.cnid)
}

/// Creates a directory.
pub fn mkdir(fs: &mut Container, dir: u64, name: &str, perm: u16) -> Result<u64> {
    create(fs, dir, name, S_IFDIR | (perm & !S_IFMT), 0)
}

/// Gives the dentry of a single-link inode a sibling id, before a second link appears.
fn prepare_dentry_for_link(fs: &mut Container, inode: &Inode) -> Result<()> {
    let (drec, query) = lookup_dentry(fs, inode.parent_id, &inode.name)?;
    if drec.ino != inode.cnid {
        error!(cnid = inode.cnid, dir = inode.parent_id, "primary link names another inode");
        return Err(Error::corrupted(format!(
            "primary link of inode 0x{:x} points to 0x{:x}",
            inode.cnid, drec.ino
        )));
    }
    if drec.sibling_id != 0 {
        return Ok(());
    }
    fs.catalog_remove_found(query)?;
    let sibling_id = create_sibling_recs(fs, inode, inode.parent_id, &inode.name)?;
    create_dentry_rec(fs, inode, inode.parent_id, &inode.name, sibling_id)
}

fn link_inner(fs: &mut Container, cnid: u64, dir: u64, name: &str) -> Result<()> {
    let saved = fs.inode(cnid)?;
    let saved_parent = fs.inode(dir)?;
    let mut inode = saved.clone();
    inode.nlink += 1;
    inode.change_time = now_ns();

    let result = (|| -> Result<()> {
        fs.persist_inode(&inode, None)?;
        if inode.nlink == 2 {
            prepare_dentry_for_link(fs, &saved)?;
        }
        create_dentry(fs, dir, name, &inode)
    })();
    if result.is_err() {
        restore(fs, vec![saved_parent, saved]);
    }
    result
}

/// Adds the name `name` in `dir` for the existing inode `cnid`.
pub fn link(fs: &mut Container, cnid: u64, dir: u64, name: &str) -> Result<()> {
    validate_name(name)?;
    let inode = fs.inode(cnid)?;
    if inode.is_dir() {
        return Err(Error::NotPermitted);
    }
    if inode.nlink == 0 {
        return Err(Error::NotFound);
    }
    require_dir(fs, dir)?;
    ensure_absent(fs, dir, name)?;

    link_inner(fs, cnid, dir, name)?;
    debug!(cnid, dir, name, "linked inode");
    Ok(())
}

/// Removes a dentry found by `lookup_dentry` along with its sibling records, and drops the
/// parent's child count.
fn delete_dentry(fs: &mut Container, dir: u64, drec_ino: u64, sibling_id: u64, query: Query) -> Result<()> {
    fs.catalog_remove_found(query)?;
    if sibling_id != 0 {
        delete_sibling_recs(fs, drec_ino, sibling_id)?;
    }

    let mut parent = fs.inode(dir)?;
    parent.touch(now_ns());
    parent.nchildren = parent.nchildren.checked_sub(1).ok_or_else(|| {
        warn!(dir, "child count underflow");
        Error::corrupted(format!("directory 0x{dir:x} has no children to remove"))
    })?;
    fs.persist_inode(&parent, None)
}

fn unlink_inner(fs: &mut Container, dir: u64, name: &str) -> Result<()> {
    let (drec, query) = lookup_dentry(fs, dir, name)?;
    let saved = fs.inode(drec.ino)?;
    let saved_parent = fs.inode(dir)?;
    let saved_private = fs.inode(PRIV_DIR_INO)?;

    let result = (|| -> Result<()> {
        delete_dentry(fs, dir, drec.ino, drec.sibling_id, query)?;

        let mut inode = saved.clone();
        inode.nlink = inode.nlink.checked_sub(1).ok_or_else(|| {
            warn!(cnid = inode.cnid, dir, "link count underflow");
            Error::corrupted(format!("inode 0x{:x} has no links to remove", inode.cnid))
        })?;
        inode.change_time = now_ns();
        let (parent_id, primary) = if inode.nlink == 0 {
            create_orphan_link(fs, &inode)?
        } else {
            find_primary_link(fs, inode.cnid)?
        };
        inode.parent_id = parent_id;
        fs.persist_inode(&inode, Some(&primary))
    })();
    if result.is_err() {
        restore(fs, vec![saved_private, saved_parent, saved]);
    }
    result
}

/// Removes the name `name` from `dir`. An inode left without links is kept under the private
/// directory until [`evict_inode`].
pub fn unlink(fs: &mut Container, dir: u64, name: &str) -> Result<()> {
    require_dir(fs, dir)?;
    let (drec, _) = lookup_dentry(fs, dir, name)?;
    if fs.inode(drec.ino)?.is_dir() {
        return Err(Error::IsDirectory);
    }
    unlink_inner(fs, dir, name)?;
    debug!(cnid = drec.ino, dir, name, "unlinked");
    Ok(())
}

/// Removes the empty directory `name` from `dir`.
pub fn rmdir(fs: &mut Container, dir: u64, name: &str) -> Result<()> {
    require_dir(fs, dir)?;
    let (drec, _) = lookup_dentry(fs, dir, name)?;
    let victim = fs.inode(drec.ino)?;
    if !victim.is_dir() {
        return Err(Error::NotDirectory);
    }
    if victim.nchildren != 0 {
        return Err(Error::NotEmpty);
    }
    unlink_inner(fs, dir, name)?;
    debug!(cnid = drec.ino, dir, name, "removed directory");
    Ok(())
}

/// Whether `ancestor` is `dir` or one of its ancestors.
fn is_ancestor(fs: &mut Container, ancestor: u64, mut dir: u64) -> Result<bool> {
    // Bounded so that a parent cycle in a corrupted catalog cannot hang us.
    for _ in 0..=u16::MAX {
        if dir == ancestor {
            return Ok(true);
        }
        if dir == ROOT_DIR_INO || dir == PRIV_DIR_INO {
            return Ok(false);
        }
        dir = fs.inode(dir)?.parent_id;
    }
    error!(dir, "directory parents form a cycle");
    Err(Error::corrupted("directory parents form a cycle"))
}

/// Checks the flags of a rename. Runs before any transaction is opened.
pub fn check_rename_flags(flags: u32) -> Result<()> {
    if flags & RENAME_EXCHANGE != 0 {
        return Err(Error::InvalidArgument("RENAME_EXCHANGE is not supported".into()));
    }
    if flags & !RENAME_NOREPLACE != 0 {
        return Err(Error::InvalidArgument(format!(
            "unsupported rename flags 0x{flags:x}"
        )));
    }
    Ok(())
}

/// Moves `old_dir/old_name` to `new_dir/new_name`, replacing the target if it exists.
pub fn rename(
    fs: &mut Container,
    old_dir: u64,
    old_name: &str,
    new_dir: u64,
    new_name: &str,
    flags: u32,
) -> Result<()> {
    check_rename_flags(flags)?;
    validate_name(new_name)?;
    require_dir(fs, old_dir)?;
    require_dir(fs, new_dir)?;

    let (source, _) = lookup_dentry(fs, old_dir, old_name)?;
    let inode = fs.inode(source.ino)?;
    let target = match lookup_dentry(fs, new_dir, new_name) {
        Ok((drec, _)) => Some(drec),
        Err(Error::NotFound) => None,
        Err(err) => return Err(err),
    };

    if let Some(target) = &target {
        if flags & RENAME_NOREPLACE != 0 {
            return Err(Error::Exists);
        }
        if target.ino == inode.cnid {
            return Ok(());
        }
        let victim = fs.inode(target.ino)?;
        match (inode.is_dir(), victim.is_dir()) {
            (true, false) => return Err(Error::NotDirectory),
            (true, true) if victim.nchildren != 0 => return Err(Error::NotEmpty),
            (false, true) => return Err(Error::IsDirectory),
            _ => {}
        }
    }
    if inode.is_dir() && is_ancestor(fs, inode.cnid, new_dir)? {
        return Err(Error::InvalidArgument(
            "cannot move a directory inside itself".into(),
        ));
    }

    let mut saved = vec![fs.inode(PRIV_DIR_INO)?, fs.inode(old_dir)?, fs.inode(new_dir)?];
    saved.push(inode.clone());
    if let Some(target) = &target {
        saved.push(fs.inode(target.ino)?);
    }

    let result = (|| -> Result<()> {
        if target.is_some() {
            unlink_inner(fs, new_dir, new_name)?;
        }
        link_inner(fs, inode.cnid, new_dir, new_name)?;
        unlink_inner(fs, old_dir, old_name)
    })();
    if let Err(err) = result {
        restore(fs, saved);
        return Err(err);
    }
    debug!(cnid = inode.cnid, old_dir, old_name, new_dir, new_name, "renamed");
    Ok(())
}

/// Releases an inode whose last link is gone: drops its orphan link and its record.
pub fn evict_inode(fs: &mut Container, cnid: u64) -> Result<()> {
    let inode = fs.inode(cnid)?;
    if inode.parent_id != PRIV_DIR_INO || inode.name != orphan_name(cnid) {
        return Err(Error::InvalidArgument(format!(
            "inode 0x{cnid:x} still has links"
        )));
    }
    delete_orphan_link(fs, cnid)?;
    fs.inode_store().delete_inode(fs, cnid)?;
    fs.forget_inode(cnid);
    debug!(cnid, "evicted inode");
    Ok(())
}
