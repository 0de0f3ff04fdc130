//! The filesystem error type and its errno mapping.
//!
//! Recoverable conditions are values, not panics; the adapter boundary
//! turns them into POSIX errnos via [`FsError::errno`].

use cryfs_core::{BlockStoreError, IntegrityViolationError};

pub type FsResult<T> = std::result::Result<T, FsError>;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    AlreadyExists,

    #[error("filename too long")]
    NameTooLong,

    #[error("invalid argument: {0}")]
    InvalidOperation(String),

    #[error("no space left on device")]
    OutOfSpace,

    #[error(transparent)]
    IntegrityViolation(#[from] IntegrityViolationError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl FsError {
    /// Stable errno mapping for the adapter boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::AlreadyExists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::InvalidOperation(_) => libc::EINVAL,
            Self::OutOfSpace => libc::ENOSPC,
            Self::IntegrityViolation(_) => libc::EIO,
            Self::Io(_) => libc::EIO,
        }
    }
}

impl From<BlockStoreError> for FsError {
    fn from(e: BlockStoreError) -> Self {
        match e {
            // A block missing underneath an existing entry is a damaged
            // filesystem, not a missing file.
            BlockStoreError::NotFound(id) => Self::Io(format!("block {id} is missing")),
            BlockStoreError::CorruptedBlock { id, reason } => {
                Self::Io(format!("block {id} is corrupted: {reason}"))
            }
            BlockStoreError::IntegrityViolation(v) => Self::IntegrityViolation(v),
            BlockStoreError::OutOfSpace => Self::OutOfSpace,
            BlockStoreError::Io(e) => Self::Io(e.to_string()),
        }
    }
}
