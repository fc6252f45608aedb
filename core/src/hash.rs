//! Filename hashing and comparison.
//!
//! Directory record keys carry a 22-bit hash of the entry name. The hash is the CRC32C of the
//! name's code points in UTF-32LE, after case folding on case-insensitive volumes. Different
//! names may share a hash; lookups resolve that by comparing the full names with
//! [`NameCodec::matches`].

use crate::key::{J_DREC_HASH_MASK, J_DREC_HASH_SHIFT};

/// Hash and comparison rules for the names of one volume.
pub trait NameCodec: Send + Sync {
    /// The hash part of `name_len_and_hash` for `name`, already shifted into place.
    fn hash(&self, name: &str) -> u32;

    /// Whether two names designate the same directory entry.
    fn matches(&self, a: &str, b: &str) -> bool;
}

fn crc_of(chars: impl Iterator<Item = char>) -> u32 {
    let mut crc = 0;
    for c in chars {
        crc = crc32c::crc32c_append(crc, &(c as u32).to_le_bytes());
    }
    ((crc & (J_DREC_HASH_MASK >> J_DREC_HASH_SHIFT)) << J_DREC_HASH_SHIFT) & J_DREC_HASH_MASK
}

/// Names are compared byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseSensitive;

impl NameCodec for CaseSensitive {
    fn hash(&self, name: &str) -> u32 {
        crc_of(name.chars())
    }

    fn matches(&self, a: &str, b: &str) -> bool {
        a == b
    }
}

/// Names are compared after folding to lower case.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitive;

impl NameCodec for CaseInsensitive {
    fn hash(&self, name: &str) -> u32 {
        crc_of(name.chars().flat_map(char::to_lowercase))
    }

    fn matches(&self, a: &str, b: &str) -> bool {
        a.chars()
            .flat_map(char::to_lowercase)
            .eq(b.chars().flat_map(char::to_lowercase))
    }
}
