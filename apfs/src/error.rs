use apfs_core::FormatError;

/// Errors returned by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A structural invariant of the container does not hold.
    #[error("filesystem corrupted: {0}")]
    FsCorrupted(String),
    /// The requested entry does not exist.
    #[error("no such entry")]
    NotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("entry already exists")]
    Exists,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("no space left in container")]
    NoSpace,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a corruption error.
    pub fn corrupted(detail: impl Into<String>) -> Self {
        Error::FsCorrupted(detail.into())
    }

    /// The POSIX errno conventionally reported for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::FsCorrupted(_) => 117, // EUCLEAN, aka EFSCORRUPTED
            Error::NotFound => 2,
            Error::OutOfMemory => 12,
            Error::NotEmpty => 39,
            Error::InvalidArgument(_) => 22,
            Error::Exists => 17,
            Error::NameTooLong => 36,
            Error::NotDirectory => 20,
            Error::IsDirectory => 21,
            Error::NotPermitted => 1,
            Error::NoSpace => 28,
            Error::Io(_) => 5,
        }
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::OutOfMemory => Error::OutOfMemory,
            other => Error::FsCorrupted(other.to_string()),
        }
    }
}
