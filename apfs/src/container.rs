//! A container: the superblock and every structure reachable from it.
//!
//! A [`Container`] owns its block device and all the state of one mounted instance: tree
//! handles, the space manager, id counters, the node cache and the inode cache. It is also
//! the [`NodeIo`] of its trees, resolving virtual oids through the object map and copying
//! nodes from older transactions before they are modified.
//!
//! Superblock layout after the object header:
//!
//! ```rust,ignore
//! magic: u32                     // "NXSB"
//! block_size: u32
//! block_count: u64
//! features: u64
//! uuid: [u8; 16]
//! next_oid: u64                  // next virtual oid
//! next_obj_id: u64               // next cnid or sibling id
//! spaceman_oid: u64
//! omap_oid: u64
//! root_tree_oid: u64             // virtual
//! extentref_tree_oid: u64
//! snap_meta_tree_oid: u64
//! label: [u8; 256]               // NUL-padded
//! ```

use std::num::NonZeroUsize;
use std::sync::Arc;

use apfs_core::key::Key;
use apfs_core::object::{
    OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_SPACEMAN,
    OBJ_EPHEMERAL, OBJ_PHYSICAL, OBJ_VIRTUAL,
};
use apfs_core::records::S_IFDIR;
use apfs_core::{CaseInsensitive, CaseSensitive, NameCodec};
use fxhash::FxHashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::btree::{Btree, BtreeKind, Node, NodeIo, Query, Storage};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::inode::{now_ns, CatalogInodes, Inode, InodeStore};
use crate::metrics::{Metric, Metrics};
use crate::object::{read_object, write_object, Object};
use crate::omap;
use crate::options::{FormatParams, Options, MIN_CONTAINER_SIZE};
use crate::spaceman::{Spaceman, SFQ_IP, SFQ_MAIN, SPACEMAN_BLOCK};

pub const NX_MAGIC: u32 = u32::from_le_bytes(*b"NXSB");
pub const SUPERBLOCK_BLOCK: u64 = 0;
pub const SUPERBLOCK_OID: u64 = 1;
/// Virtual oids below this are reserved.
pub const FIRST_VIRTUAL_OID: u64 = 1024;

/// Parent of the root and private directories.
pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_INO: u64 = 2;
/// Holds links to inodes whose last visible link was removed.
pub const PRIV_DIR_INO: u64 = 3;
/// First cnid handed out to user files.
pub const MIN_USER_INO: u64 = 16;

pub const FEATURE_CASE_INSENSITIVE: u64 = 0x1;

pub const MAX_LABEL_LEN: usize = 255;
const LABEL_OFFSET: usize = 128;
const LABEL_SIZE: usize = MAX_LABEL_LEN + 1;
const SUPERBLOCK_SIZE: usize = LABEL_OFFSET + LABEL_SIZE;

/// The decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub xid: u64,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_obj_id: u64,
    pub spaceman_oid: u64,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub label: String,
}

impl Superblock {
    pub fn decode(xid: u64, block: &[u8]) -> Result<Self> {
        if block.len() < SUPERBLOCK_SIZE {
            return Err(Error::corrupted("superblock too small"));
        }
        let le32 = |at: usize| apfs_core::le32(block, at);
        let le64 = |at: usize| apfs_core::le64(block, at);
        if le32(32) != NX_MAGIC {
            return Err(Error::corrupted(format!(
                "bad superblock magic 0x{:08x}",
                le32(32)
            )));
        }

        let label = &block[LABEL_OFFSET..LABEL_OFFSET + LABEL_SIZE];
        let Some(end) = label.iter().position(|&b| b == 0) else {
            return Err(Error::corrupted("volume label is not NUL-terminated"));
        };
        let label = std::str::from_utf8(&label[..end])
            .map_err(|_| Error::corrupted("volume label is not valid UTF-8"))?
            .to_owned();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&block[56..72]);

        Ok(Superblock {
            xid,
            block_size: le32(36),
            block_count: le64(40),
            features: le64(48),
            uuid,
            next_oid: le64(72),
            next_obj_id: le64(80),
            spaceman_oid: le64(88),
            omap_oid: le64(96),
            root_tree_oid: le64(104),
            extentref_tree_oid: le64(112),
            snap_meta_tree_oid: le64(120),
            label,
        })
    }

    /// Encodes everything after the object header.
    pub fn encode_to(&self, block: &mut [u8]) {
        let mut put = |at: usize, raw: &[u8]| block[at..at + raw.len()].copy_from_slice(raw);
        put(32, &NX_MAGIC.to_le_bytes());
        put(36, &self.block_size.to_le_bytes());
        put(40, &self.block_count.to_le_bytes());
        put(48, &self.features.to_le_bytes());
        put(56, &self.uuid);
        put(72, &self.next_oid.to_le_bytes());
        put(80, &self.next_obj_id.to_le_bytes());
        put(88, &self.spaceman_oid.to_le_bytes());
        put(96, &self.omap_oid.to_le_bytes());
        put(104, &self.root_tree_oid.to_le_bytes());
        put(112, &self.extentref_tree_oid.to_le_bytes());
        put(120, &self.snap_meta_tree_oid.to_le_bytes());
        let mut label = [0u8; LABEL_SIZE];
        let len = self.label.len().min(MAX_LABEL_LEN);
        label[..len].copy_from_slice(&self.label.as_bytes()[..len]);
        put(LABEL_OFFSET, &label);
    }
}

/// Everything a transaction may change, so that it can be restored on abort.
#[derive(Debug, Clone)]
pub(crate) struct State {
    pub xid: u64,
    pub next_oid: u64,
    pub next_obj_id: u64,
    pub omap: Btree,
    pub catalog: Btree,
    pub extentref: Btree,
    pub snap_meta: Btree,
    pub spaceman: Spaceman,
    /// Blocks of older transactions released in this one, queued at commit.
    pub pending_frees: Vec<u64>,
}

fn unopened(kind: BtreeKind) -> Btree {
    Btree {
        kind,
        root: 0,
        stats: Default::default(),
    }
}

/// One mounted container.
pub struct Container {
    pub(crate) dev: Box<dyn BlockDevice>,
    pub(crate) state: State,
    /// State at the start of the open transaction.
    pub(crate) snapshot: Option<State>,
    /// Previous contents of every inode cache slot touched by the open transaction.
    pub(crate) inode_undo: Vec<(u64, Option<Inode>)>,
    uuid: [u8; 16],
    label: String,
    features: u64,
    cache: Mutex<LruCache<u64, Node>>,
    inodes: FxHashMap<u64, Inode>,
    codec: Arc<dyn NameCodec>,
    inode_store: Arc<dyn InodeStore>,
    pub(crate) metrics: Metrics,
    pub(crate) reclaim_delay: u64,
}

impl Container {
    fn new(
        dev: Box<dyn BlockDevice>,
        state: State,
        uuid: [u8; 16],
        label: String,
        features: u64,
        options: &Options,
    ) -> Self {
        let codec: Arc<dyn NameCodec> = match &options.name_codec {
            Some(codec) => codec.clone(),
            None if features & FEATURE_CASE_INSENSITIVE != 0 => Arc::new(CaseInsensitive),
            None => Arc::new(CaseSensitive),
        };
        let inode_store = options
            .inode_store
            .clone()
            .unwrap_or_else(|| Arc::new(CatalogInodes));
        let cache_size = NonZeroUsize::new(options.node_cache_size).unwrap_or(NonZeroUsize::MIN);
        Container {
            dev,
            state,
            snapshot: None,
            inode_undo: Vec::new(),
            uuid,
            label,
            features,
            cache: Mutex::new(LruCache::new(cache_size)),
            inodes: FxHashMap::default(),
            codec,
            inode_store,
            metrics: Metrics::new(options.metrics),
            reclaim_delay: options.reclaim_delay,
        }
    }

    /// Creates a new, empty container on `dev`.
    pub fn format(
        dev: Box<dyn BlockDevice>,
        params: &FormatParams,
        options: &Options,
    ) -> Result<Self> {
        let block_size = params.block_size;
        if !block_size.is_power_of_two() || !(1024..=65536).contains(&block_size) {
            return Err(Error::InvalidArgument(format!(
                "unsupported block size {block_size}"
            )));
        }
        if block_size != dev.block_size() {
            return Err(Error::InvalidArgument(format!(
                "block size {block_size} does not match the device's {}",
                dev.block_size()
            )));
        }
        let block_count = params.block_count.unwrap_or(dev.block_count());
        if block_count > dev.block_count() {
            return Err(Error::InvalidArgument(format!(
                "{block_count} blocks requested, device has {}",
                dev.block_count()
            )));
        }
        if block_count * (block_size as u64) < MIN_CONTAINER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "container of {block_count} blocks is below the minimum of {} MiB",
                MIN_CONTAINER_SIZE >> 20
            )));
        }
        if params.label.len() > MAX_LABEL_LEN || params.label.contains('\0') {
            return Err(Error::InvalidArgument(
                "volume label must be at most 255 bytes without NUL".into(),
            ));
        }

        let uuid = params.uuid.unwrap_or_else(rand::random);
        let features = if params.case_insensitive {
            FEATURE_CASE_INSENSITIVE
        } else {
            0
        };
        let state = State {
            xid: 0,
            next_oid: FIRST_VIRTUAL_OID,
            next_obj_id: MIN_USER_INO,
            omap: unopened(BtreeKind::Omap),
            catalog: unopened(BtreeKind::Catalog),
            extentref: unopened(BtreeKind::ExtentRef),
            snap_meta: unopened(BtreeKind::SnapMeta),
            spaceman: Spaceman::layout(block_size, block_count),
            pending_frees: Vec::new(),
        };
        let mut fs = Container::new(dev, state, uuid, params.label.clone(), features, options);
        fs.transaction(|fs| fs.create_trees())?;

        info!(
            block_size,
            block_count,
            uuid = %hex::encode(uuid),
            label = %fs.label,
            "formatted container"
        );
        Ok(fs)
    }

    fn create_trees(&mut self) -> Result<()> {
        // The object map goes first: creating a virtual tree maps its root.
        self.state.omap = Btree::create(self, BtreeKind::Omap)?;
        self.state.spaceman.fq[SFQ_IP].tree = Btree::create(self, BtreeKind::FreeQueue)?;
        self.state.spaceman.fq[SFQ_MAIN].tree = Btree::create(self, BtreeKind::FreeQueue)?;
        self.state.extentref = Btree::create(self, BtreeKind::ExtentRef)?;
        self.state.snap_meta = Btree::create(self, BtreeKind::SnapMeta)?;
        self.state.catalog = Btree::create(self, BtreeKind::Catalog)?;

        let now = now_ns();
        let store = self.inode_store.clone();
        for (cnid, name) in [(ROOT_DIR_INO, "root"), (PRIV_DIR_INO, "private-dir")] {
            let dir = Inode {
                cnid,
                parent_id: ROOT_DIR_PARENT,
                name: name.into(),
                mode: S_IFDIR | 0o755,
                nlink: 1,
                create_time: now,
                mod_time: now,
                change_time: now,
                access_time: now,
                ..Default::default()
            };
            store.create_inode_record(self, &dir)?;
        }
        Ok(())
    }

    /// Opens the container stored on `dev`.
    pub fn open(dev: Box<dyn BlockDevice>, options: &Options) -> Result<Self> {
        let (object, block) = read_object(&*dev, SUPERBLOCK_BLOCK, Some(SUPERBLOCK_OID))?;
        if object.ty != OBJECT_TYPE_NX_SUPERBLOCK {
            return Err(Error::corrupted("block 0 does not hold a superblock"));
        }
        let sb = Superblock::decode(object.xid, &block)?;
        if sb.block_size as usize != dev.block_size() || sb.block_count > dev.block_count() {
            return Err(Error::corrupted(format!(
                "superblock geometry {}x{} does not fit the device",
                sb.block_count, sb.block_size
            )));
        }

        let (object, block) = read_object(&*dev, sb.spaceman_oid, Some(sb.spaceman_oid))?;
        if object.ty != OBJECT_TYPE_SPACEMAN {
            return Err(Error::corrupted("space manager object has the wrong type"));
        }
        let mut spaceman = Spaceman::decode(&block)?;
        if spaceman.block_count != sb.block_count {
            return Err(Error::corrupted(
                "space manager and superblock disagree on the block count",
            ));
        }
        let mut bitmap = Vec::with_capacity(spaceman.bitmap_blocks as usize);
        for i in 0..spaceman.bitmap_blocks {
            let mut raw = vec![0u8; dev.block_size()];
            dev.read_block(spaceman.bitmap_base + i, &mut raw)?;
            bitmap.push(raw);
        }
        spaceman.load_bitmap(bitmap.iter().map(|raw| &raw[..]))?;

        let fq_roots = [
            spaceman.fq[SFQ_IP].tree.root,
            spaceman.fq[SFQ_MAIN].tree.root,
        ];
        let state = State {
            xid: sb.xid,
            next_oid: sb.next_oid,
            next_obj_id: sb.next_obj_id,
            omap: unopened(BtreeKind::Omap),
            catalog: unopened(BtreeKind::Catalog),
            extentref: unopened(BtreeKind::ExtentRef),
            snap_meta: unopened(BtreeKind::SnapMeta),
            spaceman,
            pending_frees: Vec::new(),
        };
        let mut fs = Container::new(dev, state, sb.uuid, sb.label, sb.features, options);
        fs.state.omap = Btree::open(&fs, BtreeKind::Omap, sb.omap_oid)?;
        fs.state.catalog = Btree::open(&fs, BtreeKind::Catalog, sb.root_tree_oid)?;
        fs.state.extentref = Btree::open(&fs, BtreeKind::ExtentRef, sb.extentref_tree_oid)?;
        fs.state.snap_meta = Btree::open(&fs, BtreeKind::SnapMeta, sb.snap_meta_tree_oid)?;
        for (i, root) in fq_roots.into_iter().enumerate() {
            fs.state.spaceman.fq[i].tree = Btree::open(&fs, BtreeKind::FreeQueue, root)?;
        }

        info!(
            xid = sb.xid,
            uuid = %hex::encode(sb.uuid),
            label = %fs.label,
            "opened container"
        );
        Ok(fs)
    }

    /// Gives the device back.
    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.dev
    }

    pub(crate) fn superblock(&self) -> Superblock {
        Superblock {
            xid: self.state.xid,
            block_size: self.dev.block_size() as u32,
            block_count: self.state.spaceman.block_count,
            features: self.features,
            uuid: self.uuid,
            next_oid: self.state.next_oid,
            next_obj_id: self.state.next_obj_id,
            spaceman_oid: SPACEMAN_BLOCK,
            omap_oid: self.state.omap.root,
            root_tree_oid: self.state.catalog.root,
            extentref_tree_oid: self.state.extentref.root,
            snap_meta_tree_oid: self.state.snap_meta.root,
            label: self.label.clone(),
        }
    }

    pub(crate) fn write_superblock(&mut self) -> Result<()> {
        let mut block = vec![0u8; self.dev.block_size()];
        self.superblock().encode_to(&mut block);
        let object = Object {
            block_nr: SUPERBLOCK_BLOCK,
            oid: SUPERBLOCK_OID,
            xid: self.state.xid,
            ty: OBJECT_TYPE_NX_SUPERBLOCK,
            subtype: 0,
            flags: OBJ_EPHEMERAL,
        };
        write_object(&mut *self.dev, &object, &mut block)
    }

    pub(crate) fn write_spaceman(&mut self) -> Result<()> {
        let mut block = vec![0u8; self.dev.block_size()];
        self.state.spaceman.encode_to(&mut block);
        let object = Object {
            block_nr: SPACEMAN_BLOCK,
            oid: SPACEMAN_BLOCK,
            xid: self.state.xid,
            ty: OBJECT_TYPE_SPACEMAN,
            subtype: 0,
            flags: OBJ_PHYSICAL,
        };
        write_object(&mut *self.dev, &object, &mut block)?;

        let base = self.state.spaceman.bitmap_base;
        for (i, raw) in self.state.spaceman.bitmap_blocks().enumerate() {
            self.dev.write_block(base + i as u64, &raw)?;
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.dev.sync()?;
        Ok(())
    }

    pub(crate) fn clear_node_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.features & FEATURE_CASE_INSENSITIVE != 0
    }

    /// The last committed transaction, or the open one.
    pub fn xid(&self) -> u64 {
        self.state.xid
    }

    pub fn block_count(&self) -> u64 {
        self.state.spaceman.block_count
    }

    /// The next cnid or sibling id to be handed out.
    pub fn next_obj_id(&self) -> u64 {
        self.state.next_obj_id
    }

    pub fn omap(&self) -> &Btree {
        &self.state.omap
    }

    pub fn catalog(&self) -> &Btree {
        &self.state.catalog
    }

    pub fn extentref(&self) -> &Btree {
        &self.state.extentref
    }

    pub fn snap_meta(&self) -> &Btree {
        &self.state.snap_meta
    }

    pub fn spaceman(&self) -> &Spaceman {
        &self.state.spaceman
    }

    pub fn codec(&self) -> Arc<dyn NameCodec> {
        self.codec.clone()
    }

    pub fn inode_store(&self) -> Arc<dyn InodeStore> {
        self.inode_store.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub(crate) fn require_transaction(&self) -> Result<()> {
        if self.snapshot.is_none() {
            return Err(Error::InvalidArgument("no transaction is open".into()));
        }
        Ok(())
    }

    /// Hands out the next cnid. Sibling ids come from the same pool.
    pub fn alloc_obj_id(&mut self) -> Result<u64> {
        self.require_transaction()?;
        let id = self.state.next_obj_id;
        self.state.next_obj_id += 1;
        Ok(id)
    }

    /// Returns an inode, loading it into the inode cache if needed.
    pub fn inode(&mut self, cnid: u64) -> Result<Inode> {
        if let Some(inode) = self.inodes.get(&cnid) {
            return Ok(inode.clone());
        }
        let store = self.inode_store.clone();
        let inode = store.read_inode(self, cnid)?;
        self.cache_inode(inode.clone());
        Ok(inode)
    }

    /// Returns an inode without touching the inode cache.
    pub fn read_inode(&self, cnid: u64) -> Result<Inode> {
        match self.inodes.get(&cnid) {
            Some(inode) => Ok(inode.clone()),
            None => self.inode_store.read_inode(self, cnid),
        }
    }

    pub fn cached_inode(&self, cnid: u64) -> Option<&Inode> {
        self.inodes.get(&cnid)
    }

    pub(crate) fn cache_inode(&mut self, inode: Inode) {
        let cnid = inode.cnid;
        let old = self.inodes.insert(cnid, inode);
        if self.snapshot.is_some() {
            self.inode_undo.push((cnid, old));
        }
    }

    pub(crate) fn forget_inode(&mut self, cnid: u64) {
        let old = self.inodes.remove(&cnid);
        if self.snapshot.is_some() {
            self.inode_undo.push((cnid, old));
        }
    }

    /// Puts the inode cache back as it was when the transaction started.
    pub(crate) fn undo_inode_cache(&mut self) {
        while let Some((cnid, old)) = self.inode_undo.pop() {
            match old {
                Some(inode) => {
                    self.inodes.insert(cnid, inode);
                }
                None => {
                    self.inodes.remove(&cnid);
                }
            }
        }
    }

    /// Persists `inode` through the inode store and caches it.
    pub fn persist_inode(&mut self, inode: &Inode, new_name: Option<&str>) -> Result<()> {
        let store = self.inode_store.clone();
        store.update_inode(self, inode, new_name)?;
        let mut cached = inode.clone();
        if let Some(name) = new_name {
            cached.name = name.to_owned();
        }
        self.cache_inode(cached);
        Ok(())
    }

    pub fn catalog_get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.state.catalog.get(self, key)
    }

    /// Runs a query against the catalog.
    pub fn catalog_query(&self, query: &mut Query) -> Result<bool> {
        query.run(&self.state.catalog, self)
    }

    pub fn catalog_insert(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        self.with_catalog(|tree, io| tree.insert(io, key, val))
    }

    pub fn catalog_replace(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        self.with_catalog(|tree, io| tree.replace(io, key, val))
    }

    pub fn catalog_remove(&mut self, key: &Key) -> Result<()> {
        self.with_catalog(|tree, io| tree.remove(io, key))
    }

    /// Removes the record a catalog query just matched.
    pub fn catalog_remove_found(&mut self, query: Query) -> Result<()> {
        self.with_catalog(|tree, io| tree.remove_found(io, query))
    }

    fn with_catalog<T>(&mut self, f: impl FnOnce(&mut Btree, &mut Self) -> Result<T>) -> Result<T> {
        self.require_transaction()?;
        let mut catalog = self.state.catalog.clone();
        let out = f(&mut catalog, self)?;
        self.state.catalog = catalog;
        Ok(out)
    }

    fn omap_insert(&mut self, oid: u64, xid: u64, paddr: u64) -> Result<()> {
        let mut tree = self.state.omap.clone();
        omap::insert(&mut tree, self, oid, xid, paddr)?;
        self.state.omap = tree;
        Ok(())
    }

    fn omap_remove(&mut self, oid: u64, xid: u64) -> Result<()> {
        let mut tree = self.state.omap.clone();
        omap::remove(&mut tree, self, oid, xid)?;
        self.state.omap = tree;
        Ok(())
    }

    /// Releases a block. Blocks of the open transaction are reusable at once, older ones go
    /// through the free queue.
    fn free_block(&mut self, bno: u64, xid: u64) -> Result<()> {
        if xid == self.state.xid {
            self.state.spaceman.free_now(bno)
        } else {
            self.state.pending_frees.push(bno);
            Ok(())
        }
    }

    /// Where node `oid` of `tree` is stored.
    fn node_location(&self, tree: &Btree, oid: u64) -> Result<u64> {
        match tree.kind.storage() {
            Storage::Physical => Ok(oid),
            Storage::Virtual => match omap::lookup(&self.state.omap, self, oid, self.state.xid)? {
                Some(record) => Ok(record.val.paddr),
                None => {
                    warn!(oid, xid = self.state.xid, "virtual node missing from the object map");
                    Err(Error::corrupted(format!(
                        "no object map entry for virtual node 0x{oid:x}"
                    )))
                }
            },
        }
    }
}

fn storage_flags(tree: &Btree) -> u32 {
    match tree.kind.storage() {
        Storage::Physical => OBJ_PHYSICAL,
        Storage::Virtual => OBJ_VIRTUAL,
    }
}

impl NodeIo for Container {
    fn block_size(&self) -> usize {
        self.dev.block_size()
    }

    fn read_node(&self, tree: &Btree, oid: u64) -> Result<Node> {
        self.metrics.count(Metric::NodeReads);
        let bno = self.node_location(tree, oid)?;
        if let Some(node) = self.cache.lock().get(&bno) {
            if node.object.oid == oid {
                self.metrics.count(Metric::NodeCacheHits);
                return Ok(node.clone());
            }
        }

        let (object, raw) = read_object(&*self.dev, bno, Some(oid))?;
        if (object.ty != OBJECT_TYPE_BTREE && object.ty != OBJECT_TYPE_BTREE_NODE)
            || object.subtype != tree.kind.subtype()
            || object.flags != storage_flags(tree)
        {
            warn!(oid, bno, kind = ?tree.kind, "node object has the wrong type");
            return Err(Error::corrupted(format!(
                "object 0x{oid:x} is not a {:?} tree node",
                tree.kind
            )));
        }
        let node = Node::decode(object, raw, tree.kind.fixed())?;
        if node.is_root() != (object.ty == OBJECT_TYPE_BTREE) {
            return Err(Error::corrupted(format!(
                "object type of node 0x{oid:x} disagrees with its root flag"
            )));
        }
        self.cache.lock().put(bno, node.clone());
        Ok(node)
    }

    fn alloc_node(&mut self, tree: &Btree) -> Result<Object> {
        self.require_transaction()?;
        let xid = self.state.xid;
        let bno = self.state.spaceman.alloc()?;
        let oid = match tree.kind.storage() {
            Storage::Physical => bno,
            Storage::Virtual => {
                let oid = self.state.next_oid;
                self.state.next_oid += 1;
                self.omap_insert(oid, xid, bno)?;
                oid
            }
        };
        Ok(Object {
            block_nr: bno,
            oid,
            xid,
            ty: OBJECT_TYPE_BTREE_NODE,
            subtype: tree.kind.subtype(),
            flags: storage_flags(tree),
        })
    }

    fn write_node(&mut self, tree: &Btree, node: &mut Node) -> Result<()> {
        self.require_transaction()?;
        let xid = self.state.xid;
        if node.object.xid != xid {
            self.metrics.count(Metric::CowCopies);
            let old = node.object;
            let bno = self.state.spaceman.alloc()?;
            node.object.block_nr = bno;
            node.object.xid = xid;
            match tree.kind.storage() {
                Storage::Physical => node.object.oid = bno,
                Storage::Virtual => {
                    self.omap_remove(old.oid, old.xid)?;
                    self.omap_insert(old.oid, xid, bno)?;
                }
            }
            self.cache.lock().pop(&old.block_nr);
            self.free_block(old.block_nr, old.xid)?;
        }

        let root = node.is_root();
        node.object.ty = if root {
            OBJECT_TYPE_BTREE
        } else {
            OBJECT_TYPE_BTREE_NODE
        };
        node.object.subtype = tree.kind.subtype();
        node.object.flags = storage_flags(tree);
        let info = root.then(|| tree.info(self.dev.block_size()));
        let object = node.object;
        write_object(&mut *self.dev, &object, node.encode(info.as_ref()))?;
        self.metrics.count(Metric::NodeWrites);
        self.cache.lock().put(object.block_nr, node.clone());
        Ok(())
    }

    fn free_node(&mut self, tree: &Btree, object: &Object) -> Result<()> {
        self.require_transaction()?;
        if tree.kind.storage() == Storage::Virtual {
            self.omap_remove(object.oid, object.xid)?;
        }
        self.cache.lock().pop(&object.block_nr);
        self.free_block(object.block_nr, object.xid)
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use apfs_core::records::build_inode_key;

    const BLOCKS: u64 = 32768;

    fn format() -> Container {
        let dev = MemDevice::new(4096, BLOCKS);
        let mut params = FormatParams::new();
        params.label("test volume");
        params.uuid([7; 16]);
        let mut options = Options::new();
        options.metrics(true);
        Container::format(Box::new(dev), &params, &options).unwrap()
    }

    #[test]
    fn format_then_open() {
        let fs = format();
        assert_eq!(fs.xid(), 1);
        let dev = fs.into_device();

        let mut fs = Container::open(dev, &Options::new()).unwrap();
        assert_eq!(fs.label(), "test volume");
        assert_eq!(fs.uuid(), [7; 16]);
        assert_eq!(fs.xid(), 1);
        assert_eq!(fs.next_obj_id(), MIN_USER_INO);
        assert!(!fs.is_case_insensitive());

        let root = fs.inode(ROOT_DIR_INO).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.parent_id, ROOT_DIR_PARENT);
        assert_eq!(root.nchildren, 0);
        assert_eq!(fs.inode(PRIV_DIR_INO).unwrap().name, "private-dir");
        assert!(matches!(fs.inode(MIN_USER_INO), Err(Error::NotFound)));
        assert_eq!(fs.catalog().stats.key_count, 2);
        assert!(fs.catalog().root >= FIRST_VIRTUAL_OID);
    }

    #[test]
    fn superblock_fields_keep_their_offsets() {
        let sb = Superblock {
            xid: 9,
            block_size: 4096,
            block_count: 0x0102_0304_0506_0708,
            features: FEATURE_CASE_INSENSITIVE,
            uuid: [3; 16],
            next_oid: 0x1111,
            next_obj_id: 0x2222,
            spaceman_oid: 0x3333,
            omap_oid: 0x4444,
            root_tree_oid: 0x5555,
            extentref_tree_oid: 0x6666,
            snap_meta_tree_oid: 0x7777,
            label: "fields".to_owned(),
        };
        let mut block = vec![0u8; 4096];
        sb.encode_to(&mut block);
        assert_eq!(Superblock::decode(9, &block).unwrap(), sb);

        block[32] ^= 1;
        assert!(matches!(Superblock::decode(9, &block), Err(Error::FsCorrupted(_))));
        assert!(matches!(
            Superblock::decode(9, &block[..SUPERBLOCK_SIZE - 1]),
            Err(Error::FsCorrupted(_))
        ));
    }

    #[test]
    fn rejects_bad_parameters() {
        let small = MemDevice::new(4096, BLOCKS - 1);
        assert!(matches!(
            Container::format(Box::new(small), &FormatParams::new(), &Options::new()),
            Err(Error::InvalidArgument(_))
        ));

        let mut params = FormatParams::new();
        params.label("x".repeat(256));
        let dev = MemDevice::new(4096, BLOCKS);
        assert!(matches!(
            Container::format(Box::new(dev), &params, &Options::new()),
            Err(Error::InvalidArgument(_))
        ));

        let mut params = FormatParams::new();
        params.block_size(8192);
        let dev = MemDevice::new(4096, BLOCKS);
        assert!(matches!(
            Container::format(Box::new(dev), &params, &Options::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn label_at_the_limit() {
        let mut params = FormatParams::new();
        params.label("é".repeat(127));
        let dev = MemDevice::new(4096, BLOCKS);
        let fs = Container::format(Box::new(dev), &params, &Options::new()).unwrap();
        let fs = Container::open(fs.into_device(), &Options::new()).unwrap();
        assert_eq!(fs.label(), "é".repeat(127));
    }

    #[test]
    fn mutations_need_a_transaction() {
        let mut fs = format();
        assert!(matches!(
            fs.catalog_insert(&build_inode_key(100), &[0; 92]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(fs.alloc_obj_id().is_err());
    }

    #[test]
    fn catalog_nodes_are_copied_once_per_transaction() {
        let mut fs = format();
        let root_before = fs.catalog().root;
        let mapping = omap::lookup(fs.omap(), &fs, root_before, fs.xid())
            .unwrap()
            .unwrap();

        fs.transaction(|fs| {
            let store = fs.inode_store();
            let mut dir = fs.inode(ROOT_DIR_INO)?;
            dir.nchildren = 5;
            store.update_inode(fs, &dir, None)?;
            dir.nchildren = 6;
            store.update_inode(fs, &dir, None)
        })
        .unwrap();

        // The virtual root keeps its oid and moves to a new block.
        assert_eq!(fs.catalog().root, root_before);
        let moved = omap::lookup(fs.omap(), &fs, root_before, fs.xid())
            .unwrap()
            .unwrap();
        assert_eq!(moved.xid, 2);
        assert_ne!(moved.val.paddr, mapping.val.paddr);
        assert_eq!(fs.metrics.get(Metric::CowCopies).map(|n| n > 0), Some(true));

        // The old block waits in the free queue.
        assert!(fs.spaceman().is_allocated(mapping.val.paddr));
        assert!(fs.spaceman().fq[SFQ_MAIN].count > 0);
        assert_eq!(fs.spaceman().fq[SFQ_MAIN].oldest_xid, 2);
    }
}
