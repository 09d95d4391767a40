//! VFS Error Types
//!
//! Defines error conditions that can occur during filesystem operations.

use crate::block::BlockError;

/// Filesystem error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Not a directory (when directory expected)
    NotDirectory,
    /// Is a directory (when file expected)
    IsDirectory,
    /// Directory still has entries
    NotEmpty,
    /// File or directory already exists
    AlreadyExists,
    /// No free cluster left on the volume
    NoSpace,
    /// Underlying block device failed; carries the device error
    Io(BlockError),
    /// Malformed or empty path
    InvalidPath,
    /// No filesystem mounted at the path
    NotMounted,
    /// Mutation attempted on a read-only mount
    ReadOnly,
    /// Boot sector, FAT size field or FSInfo signatures are wrong
    CorruptVolume,
    /// Operation not supported by this filesystem
    Unsupported,
    /// Open-file table is full
    TooManyOpenFiles,
    /// File descriptor does not name an open file
    BadDescriptor,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::IsDirectory => write!(f, "is a directory"),
            FsError::NotEmpty => write!(f, "directory not empty"),
            FsError::AlreadyExists => write!(f, "file exists"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::Io(err) => write!(f, "I/O error: {}", err),
            FsError::InvalidPath => write!(f, "invalid path"),
            FsError::NotMounted => write!(f, "not mounted"),
            FsError::ReadOnly => write!(f, "read-only filesystem"),
            FsError::CorruptVolume => write!(f, "corrupt volume"),
            FsError::Unsupported => write!(f, "operation not supported"),
            FsError::TooManyOpenFiles => write!(f, "too many open files"),
            FsError::BadDescriptor => write!(f, "bad file descriptor"),
        }
    }
}

impl From<BlockError> for FsError {
    fn from(err: BlockError) -> Self {
        FsError::Io(err)
    }
}
