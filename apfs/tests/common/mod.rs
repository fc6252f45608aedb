use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apfs::catalog::{lookup_dentry, sibling_links, sibling_map_owner};
use apfs::{
    CatalogInodes, CheckReport, Container, Error, Filesystem, FormatParams, Inode, InodeStore,
    MemDevice, NameCodec, Options, Result, ROOT_DIR_INO,
};
use apfs_core::records::{Drec, SiblingLink, S_IFREG};

pub const BLOCKS: u64 = 32768;

pub fn format(options: &Options) -> Container {
    let dev = MemDevice::new(4096, BLOCKS);
    Container::format(Box::new(dev), &FormatParams::new(), options).unwrap()
}

/// Generates a random file name of up to `max_len` bytes.
#[allow(dead_code)]
pub fn random_name(rng: &mut impl rand::Rng, max_len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-.";
    loop {
        let len = rng.gen_range(1..=max_len);
        let name: String = (0..len)
            .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
            .collect();
        if name != "." && name != ".." {
            return name;
        }
    }
}

/// Hashes every name alike, so that every entry of a directory collides with every other.
pub struct SingleHash;

impl NameCodec for SingleHash {
    fn hash(&self, _name: &str) -> u32 {
        apfs::CaseSensitive.hash("shared")
    }

    fn matches(&self, a: &str, b: &str) -> bool {
        a == b
    }
}

/// Stores inodes in the catalog, but fails updates of one chosen inode.
#[derive(Default)]
pub struct FailingStore {
    fail_cnid: AtomicU64,
}

#[allow(dead_code)]
impl FailingStore {
    pub fn fail_updates_of(&self, cnid: u64) {
        self.fail_cnid.store(cnid, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_cnid.store(0, Ordering::SeqCst);
    }
}

impl InodeStore for FailingStore {
    fn new_inode(&self, fs: &mut Container, dir: &Inode, mode: u16, rdev: u32) -> Result<Inode> {
        CatalogInodes.new_inode(fs, dir, mode, rdev)
    }

    fn create_inode_record(&self, fs: &mut Container, inode: &Inode) -> Result<()> {
        CatalogInodes.create_inode_record(fs, inode)
    }

    fn update_inode(&self, fs: &mut Container, inode: &Inode, new_name: Option<&str>) -> Result<()> {
        if inode.cnid == self.fail_cnid.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected failure")));
        }
        CatalogInodes.update_inode(fs, inode, new_name)
    }

    fn read_inode(&self, fs: &Container, cnid: u64) -> Result<Inode> {
        CatalogInodes.read_inode(fs, cnid)
    }

    fn delete_inode(&self, fs: &mut Container, cnid: u64) -> Result<()> {
        CatalogInodes.delete_inode(fs, cnid)
    }
}

pub struct Test {
    pub fs: Filesystem,
}

#[allow(dead_code)]
impl Test {
    pub fn new() -> Self {
        Self::with_options(&Options::new())
    }

    pub fn with_options(options: &Options) -> Self {
        Test {
            fs: Filesystem::from(format(options)),
        }
    }

    pub fn with_codec(codec: Arc<dyn NameCodec>) -> Self {
        let mut options = Options::new();
        options.name_codec(codec);
        Self::with_options(&options)
    }

    pub fn create(&self, dir: u64, name: &str) -> u64 {
        self.fs.create(dir, name, S_IFREG | 0o644, 0).unwrap()
    }

    pub fn mkdir(&self, dir: u64, name: &str) -> u64 {
        self.fs.mkdir(dir, name, 0o755).unwrap()
    }

    /// `None` if the name does not exist. Any other error fails the test.
    pub fn lookup(&self, dir: u64, name: &str) -> Option<u64> {
        match self.fs.lookup(dir, name) {
            Ok(cnid) => Some(cnid),
            Err(Error::NotFound) => None,
            Err(err) => panic!("lookup of {name:?} failed: {err}"),
        }
    }

    /// Entry names of `dir` without the dots, sorted.
    pub fn names(&self, dir: u64) -> Vec<String> {
        let mut names = Vec::new();
        self.fs
            .readdir(dir, 2, &mut |name, _, _| {
                names.push(name.to_owned());
                true
            })
            .unwrap();
        names.sort();
        names
    }

    pub fn root_names(&self) -> Vec<String> {
        self.names(ROOT_DIR_INO)
    }

    pub fn inode(&self, cnid: u64) -> Inode {
        self.fs.stat(cnid).unwrap()
    }

    pub fn drec(&self, dir: u64, name: &str) -> Drec {
        self.fs
            .with_container(|fs| lookup_dentry(fs, dir, name))
            .map(|(drec, _)| drec)
            .unwrap()
    }

    pub fn sibling_links(&self, cnid: u64) -> Vec<SiblingLink> {
        self.fs
            .with_container(|fs| sibling_links(fs, cnid))
            .unwrap()
    }

    pub fn sibling_map_owner(&self, sibling_id: u64) -> Option<u64> {
        self.fs
            .with_container(|fs| sibling_map_owner(fs, sibling_id))
            .unwrap()
    }

    /// The raw bytes of every catalog node, in walk order.
    pub fn catalog_image(&self) -> Vec<Vec<u8>> {
        self.fs.with_container(|fs| {
            let mut nodes = Vec::new();
            fs.catalog()
                .walk(fs, &mut |node| {
                    nodes.push(node.bytes(0, node.block_size()).to_vec());
                    Ok(())
                })
                .unwrap();
            nodes
        })
    }

    pub fn check(&self) -> CheckReport {
        self.fs.check().unwrap()
    }
}
