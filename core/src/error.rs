use std::collections::TryReserveError;

/// A failure to decode or encode an on-disk structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("{what}: expected at least {expected} bytes, found {found}")]
    Truncated {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{what}: name is not NUL-terminated")]
    MissingNul { what: &'static str },
    #[error("{what}: stored name length {stored} does not match actual length {actual}")]
    NameLength {
        what: &'static str,
        stored: usize,
        actual: usize,
    },
    #[error("{what}: name is not valid UTF-8")]
    BadName { what: &'static str },
    #[error("{what}: unexpected record type {found}")]
    WrongType { what: &'static str, found: u8 },
    #[error("{0}")]
    Invalid(String),
    #[error("out of memory")]
    OutOfMemory,
}

impl From<TryReserveError> for FormatError {
    fn from(_: TryReserveError) -> Self {
        FormatError::OutOfMemory
    }
}

/// Returns an error unless `buf` holds at least `expected` bytes.
pub(crate) fn need(what: &'static str, buf: &[u8], expected: usize) -> Result<(), FormatError> {
    if buf.len() < expected {
        return Err(FormatError::Truncated {
            what,
            expected,
            found: buf.len(),
        });
    }
    Ok(())
}

/// Allocates an empty buffer with room for exactly `len` bytes.
pub(crate) fn buffer(len: usize) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    Ok(buf)
}
