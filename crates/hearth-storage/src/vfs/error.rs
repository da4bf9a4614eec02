//! Path resolution errors.

use std::io;
use thiserror::Error;

/// Why a virtual or real path was rejected.
#[derive(Debug, Error)]
pub enum PathError {
    /// Empty, relative, or otherwise malformed path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Path contains a `.` or `..` segment.
    #[error("path traversal rejected: {0}")]
    Traversal(String),

    /// First segment is not one of the known bases.
    #[error("unknown base: {0}")]
    UnknownBase(String),

    /// Path resolves (after symlink expansion) outside its base root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Real path is not under any base root.
    #[error("not under any storage root: {0}")]
    OutsideRoots(String),

    /// I/O error while resolving.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PathError {
    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }
}

/// Path result type.
pub type PathResult<T> = Result<T, PathError>;
