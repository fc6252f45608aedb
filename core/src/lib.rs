//! On-disk formats of the APFS catalog and object map.
//!
//! This crate defines the byte layouts of objects, B-tree nodes and catalog records, and the
//! key ordering rules the B-tree engine relies on. Nothing here performs I/O: every function
//! works on caller-provided buffers, which keeps the formats testable in isolation.

pub mod error;
pub mod hash;
pub mod key;
pub mod node;
pub mod object;
pub mod records;

pub use error::FormatError;
pub use hash::{CaseInsensitive, CaseSensitive, NameCodec};
pub use key::{Key, KeyRef};

/// Reads a little-endian `u16` at `off`. The caller guarantees the bounds.
#[inline]
pub fn le16(buf: &[u8], off: usize) -> u16 {
    // UNWRAP: slice of length 2 always converts.
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

/// Reads a little-endian `u32` at `off`. The caller guarantees the bounds.
#[inline]
pub fn le32(buf: &[u8], off: usize) -> u32 {
    // UNWRAP: slice of length 4 always converts.
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Reads a little-endian `u64` at `off`. The caller guarantees the bounds.
#[inline]
pub fn le64(buf: &[u8], off: usize) -> u64 {
    // UNWRAP: slice of length 8 always converts.
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}
