//! Block devices backing a container.

use fxhash::FxHashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt as _;
use std::path::Path;

/// A device addressed in fixed-size blocks.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    /// Fills `buf`, which is exactly one block long, with the contents of block `bno`.
    fn read_block(&self, bno: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_block(&mut self, bno: u64, buf: &[u8]) -> io::Result<()>;

    /// Makes every previous write durable.
    fn sync(&mut self) -> io::Result<()>;
}

fn check_range(bno: u64, count: u64) -> io::Result<()> {
    if bno >= count {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block {bno} out of range (device has {count} blocks)"),
        ));
    }
    Ok(())
}

/// A sparse in-memory device. Blocks never written read as zeroes.
pub struct MemDevice {
    block_size: usize,
    block_count: u64,
    blocks: FxHashMap<u64, Box<[u8]>>,
}

impl MemDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        MemDevice {
            block_size,
            block_count,
            blocks: FxHashMap::default(),
        }
    }

    /// Number of blocks that were written at least once.
    pub fn touched_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, bno: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(bno, self.block_count)?;
        match self.blocks.get(&bno) {
            Some(block) => buf.copy_from_slice(block),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&mut self, bno: u64, buf: &[u8]) -> io::Result<()> {
        check_range(bno, self.block_count)?;
        if buf.len() != self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes to a {} byte block", buf.len(), self.block_size),
            ));
        }
        self.blocks.insert(bno, buf.into());
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A device backed by a regular file or a block device node.
pub struct FileDevice {
    file: File,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Opens an existing image. The block count is derived from the file length.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(FileDevice {
            file,
            block_size,
            block_count: len / block_size as u64,
        })
    }

    /// Creates an image of `block_count` blocks, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, block_size: usize, block_count: u64) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_size as u64 * block_count)?;
        Ok(FileDevice {
            file,
            block_size,
            block_count,
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, bno: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(bno, self.block_count)?;
        self.file
            .read_exact_at(buf, bno * self.block_size as u64)
    }

    fn write_block(&mut self, bno: u64, buf: &[u8]) -> io::Result<()> {
        check_range(bno, self.block_count)?;
        self.file.write_all_at(buf, bno * self.block_size as u64)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
