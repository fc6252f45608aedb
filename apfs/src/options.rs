use std::sync::Arc;

use apfs_core::NameCodec;

use crate::inode::InodeStore;

/// Smallest container [`crate::Container::format`] accepts.
pub const MIN_CONTAINER_SIZE: u64 = 128 << 20;

/// Options when opening or formatting a [`crate::Container`].
#[derive(Clone)]
pub struct Options {
    /// Enable or disable metrics collection.
    pub(crate) metrics: bool,
    /// How many transactions a freed block waits in the free queue before it is reused.
    pub(crate) reclaim_delay: u64,
    /// The maximum number of decoded nodes kept in memory.
    pub(crate) node_cache_size: usize,
    pub(crate) name_codec: Option<Arc<dyn NameCodec>>,
    pub(crate) inode_store: Option<Arc<dyn InodeStore>>,
}

impl Options {
    /// Create a new `Options` instance with the default values.
    pub fn new() -> Self {
        Self {
            metrics: false,
            reclaim_delay: 1,
            node_cache_size: 1024,
            name_codec: None,
            inode_store: None,
        }
    }

    /// Set metrics collection on or off.
    ///
    /// Default: off.
    pub fn metrics(&mut self, metrics: bool) {
        self.metrics = metrics;
    }

    /// Set the number of transactions a block freed by copy-on-write stays queued before it
    /// returns to the allocation bitmap.
    ///
    /// Default: 1, meaning blocks freed in one transaction are reclaimed when the next one
    /// commits.
    pub fn reclaim_delay(&mut self, reclaim_delay: u64) {
        self.reclaim_delay = reclaim_delay;
    }

    /// Set the number of decoded nodes kept in the node cache.
    ///
    /// Must be more than 0.
    ///
    /// Default: 1024.
    pub fn node_cache_size(&mut self, node_cache_size: usize) {
        assert!(node_cache_size > 0);
        self.node_cache_size = node_cache_size;
    }

    /// Override the filename hash and comparison rules.
    ///
    /// By default they follow the case sensitivity recorded in the superblock.
    pub fn name_codec(&mut self, codec: Arc<dyn NameCodec>) {
        self.name_codec = Some(codec);
    }

    /// Override where inodes are stored.
    ///
    /// Default: inode records in the catalog, see [`crate::inode::CatalogInodes`].
    pub fn inode_store(&mut self, store: Arc<dyn InodeStore>) {
        self.inode_store = Some(store);
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of a new container.
#[derive(Debug, Clone)]
pub struct FormatParams {
    pub(crate) block_size: usize,
    pub(crate) block_count: Option<u64>,
    pub(crate) label: String,
    pub(crate) uuid: Option<[u8; 16]>,
    pub(crate) case_insensitive: bool,
}

impl FormatParams {
    pub fn new() -> Self {
        Self {
            block_size: 4096,
            block_count: None,
            label: String::from("untitled"),
            uuid: None,
            case_insensitive: false,
        }
    }

    /// Set the block size. Must be a power of two between 1024 and 65536.
    ///
    /// Default: 4096.
    pub fn block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    /// Set the number of blocks of the container.
    ///
    /// Default: the whole device.
    pub fn block_count(&mut self, block_count: u64) {
        self.block_count = Some(block_count);
    }

    /// Set the volume label. It must fit in 255 bytes.
    pub fn label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Set the container UUID.
    ///
    /// Default: random.
    pub fn uuid(&mut self, uuid: [u8; 16]) {
        self.uuid = Some(uuid);
    }

    /// Make filename lookups ignore case.
    ///
    /// Default: off.
    pub fn case_insensitive(&mut self, case_insensitive: bool) {
        self.case_insensitive = case_insensitive;
    }
}

impl Default for FormatParams {
    fn default() -> Self {
        Self::new()
    }
}
