//! Inodes and where they are stored.

use std::time::{SystemTime, UNIX_EPOCH};

use apfs_core::key::Key;
use apfs_core::records::{build_inode_key, InodeVal, S_IFDIR, S_IFMT};

use crate::container::Container;
use crate::error::{Error, Result};

/// The in-memory state of an inode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inode {
    pub cnid: u64,
    /// Parent of the primary link.
    pub parent_id: u64,
    /// Name of the primary link.
    pub name: String,
    pub mode: u16,
    /// Link count. Directories always have one link.
    pub nlink: u32,
    /// Number of entries, for directories.
    pub nchildren: u32,
    pub rdev: u32,
    pub create_time: u64,
    pub mod_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub owner: u32,
    pub group: u32,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// The stored form. Directories persist their child count, other files their link
    /// count.
    pub fn to_val(&self) -> InodeVal {
        let count = if self.is_dir() { self.nchildren } else { self.nlink };
        InodeVal {
            parent_id: self.parent_id,
            private_id: self.cnid,
            create_time: self.create_time,
            mod_time: self.mod_time,
            change_time: self.change_time,
            access_time: self.access_time,
            internal_flags: 0,
            nchildren_or_nlink: count as i32,
            bsd_flags: 0,
            owner: self.owner,
            group: self.group,
            mode: self.mode,
            name: self.name.clone(),
            rdev: self.rdev,
        }
    }

    pub fn from_val(cnid: u64, val: InodeVal) -> Result<Self> {
        if val.nchildren_or_nlink < 0 {
            return Err(Error::corrupted(format!(
                "inode 0x{cnid:x} has a negative link or child count"
            )));
        }
        let count = val.nchildren_or_nlink as u32;
        let mut inode = Inode {
            cnid,
            parent_id: val.parent_id,
            name: val.name,
            mode: val.mode,
            nlink: count,
            nchildren: 0,
            rdev: val.rdev,
            create_time: val.create_time,
            mod_time: val.mod_time,
            change_time: val.change_time,
            access_time: val.access_time,
            owner: val.owner,
            group: val.group,
        };
        if inode.is_dir() {
            inode.nlink = 1;
            inode.nchildren = count;
        }
        Ok(inode)
    }

    /// Sets the modification and change times.
    pub fn touch(&mut self, now: u64) {
        self.mod_time = now;
        self.change_time = now;
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Creation and persistence of inodes.
///
/// Every mutating method runs inside the transaction the caller opened on `fs`.
pub trait InodeStore: Send + Sync {
    /// Allocates a new inode under directory `dir`. Nothing is stored yet.
    fn new_inode(&self, fs: &mut Container, dir: &Inode, mode: u16, rdev: u32) -> Result<Inode>;

    /// Stores the record of an inode just returned by [`InodeStore::new_inode`].
    fn create_inode_record(&self, fs: &mut Container, inode: &Inode) -> Result<()>;

    /// Stores the current state of `inode`, with `new_name` as the primary link name if
    /// given.
    fn update_inode(&self, fs: &mut Container, inode: &Inode, new_name: Option<&str>)
        -> Result<()>;

    /// Reads an inode. Fails with [`Error::NotFound`] if it does not exist.
    fn read_inode(&self, fs: &Container, cnid: u64) -> Result<Inode>;

    fn delete_inode(&self, fs: &mut Container, cnid: u64) -> Result<()>;
}

/// Keeps inodes as `INODE` records in the catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogInodes;

impl InodeStore for CatalogInodes {
    fn new_inode(&self, fs: &mut Container, dir: &Inode, mode: u16, rdev: u32) -> Result<Inode> {
        let cnid = fs.alloc_obj_id()?;
        let now = now_ns();
        let mut inode = Inode {
            cnid,
            parent_id: dir.cnid,
            mode,
            nlink: 1,
            rdev,
            create_time: now,
            mod_time: now,
            change_time: now,
            access_time: now,
            owner: dir.owner,
            group: dir.group,
            ..Default::default()
        };
        if inode.is_dir() {
            inode.rdev = 0;
        }
        Ok(inode)
    }

    fn create_inode_record(&self, fs: &mut Container, inode: &Inode) -> Result<()> {
        let val = inode.to_val().encode()?;
        fs.catalog_insert(&build_inode_key(inode.cnid), &val)
    }

    fn update_inode(
        &self,
        fs: &mut Container,
        inode: &Inode,
        new_name: Option<&str>,
    ) -> Result<()> {
        let mut val = inode.to_val();
        if let Some(name) = new_name {
            val.name = name.to_owned();
        }
        let raw = val.encode()?;
        match fs.catalog_replace(&build_inode_key(inode.cnid), &raw) {
            Err(Error::NotFound) => Err(Error::corrupted(format!(
                "record for inode 0x{:x} is missing",
                inode.cnid
            ))),
            other => other,
        }
    }

    fn read_inode(&self, fs: &Container, cnid: u64) -> Result<Inode> {
        let raw = fs.catalog_get(&Key::inode(cnid))?.ok_or(Error::NotFound)?;
        Inode::from_val(cnid, InodeVal::decode(&raw)?)
    }

    fn delete_inode(&self, fs: &mut Container, cnid: u64) -> Result<()> {
        fs.catalog_remove(&Key::inode(cnid))
    }
}
