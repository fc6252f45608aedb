//! An APFS catalog B-tree and object map engine.
//!
//! A [`Container`] holds one formatted or opened container and exposes the raw transactional
//! API. [`Filesystem`] wraps it with the locking and transaction scoping expected by a
//! filesystem driver: lookups and directory listings share the lock, every operation that
//! changes the directory tree takes it exclusively and runs in a transaction of its own.

use parking_lot::RwLock;

pub use apfs_core::{CaseInsensitive, CaseSensitive, NameCodec};

pub use check::{check, CheckReport};
pub use container::{Container, PRIV_DIR_INO, ROOT_DIR_INO};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use dir::{RENAME_EXCHANGE, RENAME_NOREPLACE, RENAME_WHITEOUT};
pub use error::{Error, Result};
pub use inode::{CatalogInodes, Inode, InodeStore};
pub use metrics::{Metric, Metrics};
pub use options::{FormatParams, Options, MIN_CONTAINER_SIZE};

pub mod btree;
pub mod catalog;
mod check;
pub mod container;
mod device;
pub mod dir;
mod error;
pub mod inode;
mod metrics;
pub mod object;
pub mod omap;
mod options;
pub mod spaceman;
mod transaction;

/// A mounted container, safe to share between threads.
pub struct Filesystem {
    inner: RwLock<Container>,
}

impl Filesystem {
    /// Formats `dev` and mounts the result.
    pub fn format(dev: Box<dyn BlockDevice>, params: &FormatParams, options: &Options) -> Result<Self> {
        Ok(Self::from(Container::format(dev, params, options)?))
    }

    pub fn open(dev: Box<dyn BlockDevice>, options: &Options) -> Result<Self> {
        Ok(Self::from(Container::open(dev, options)?))
    }

    /// Unmounts, giving back the container.
    pub fn into_container(self) -> Container {
        self.inner.into_inner()
    }

    /// Runs `f` with shared access to the container.
    pub fn with_container<T>(&self, f: impl FnOnce(&Container) -> T) -> T {
        f(&self.inner.read())
    }

    fn write<T>(&self, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        self.inner.write().transaction(f)
    }

    pub fn lookup(&self, dir: u64, name: &str) -> Result<u64> {
        dir::lookup(&self.inner.read(), dir, name)
    }

    /// Lists `dir` from `offset`. See [`dir::readdir`].
    pub fn readdir(
        &self,
        dir: u64,
        offset: u64,
        emit: &mut dyn FnMut(&str, u64, u8) -> bool,
    ) -> Result<u64> {
        dir::readdir(&self.inner.read(), dir, offset, emit)
    }

    pub fn stat(&self, cnid: u64) -> Result<Inode> {
        self.inner.read().read_inode(cnid)
    }

    pub fn create(&self, dir: u64, name: &str, mode: u16, rdev: u32) -> Result<u64> {
        self.write(|fs| dir::create(fs, dir, name, mode, rdev))
    }

    pub fn mkdir(&self, dir: u64, name: &str, perm: u16) -> Result<u64> {
        self.write(|fs| dir::mkdir(fs, dir, name, perm))
    }

    pub fn link(&self, cnid: u64, dir: u64, name: &str) -> Result<()> {
        self.write(|fs| dir::link(fs, cnid, dir, name))
    }

    pub fn unlink(&self, dir: u64, name: &str) -> Result<()> {
        self.write(|fs| dir::unlink(fs, dir, name))
    }

    pub fn rmdir(&self, dir: u64, name: &str) -> Result<()> {
        self.write(|fs| dir::rmdir(fs, dir, name))
    }

    pub fn rename(
        &self,
        old_dir: u64,
        old_name: &str,
        new_dir: u64,
        new_name: &str,
        flags: u32,
    ) -> Result<()> {
        dir::check_rename_flags(flags)?;
        self.write(|fs| dir::rename(fs, old_dir, old_name, new_dir, new_name, flags))
    }

    /// Releases an inode after its last link was removed and nothing uses it anymore.
    pub fn evict_inode(&self, cnid: u64) -> Result<()> {
        self.write(|fs| dir::evict_inode(fs, cnid))
    }

    /// Runs the consistency checker.
    pub fn check(&self) -> Result<CheckReport> {
        check(&self.inner.read())
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.read().metrics.clone()
    }
}

impl From<Container> for Filesystem {
    fn from(fs: Container) -> Self {
        Filesystem {
            inner: RwLock::new(fs),
        }
    }
}
