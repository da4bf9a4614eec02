//! Storage error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;
use crate::vfs::PathError;

/// Error returned by every storage control-plane operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path classification forbids the requested action.
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    /// A local share already exists for this path.
    #[error("share already exists: {0}")]
    ShareAlreadyExists(String),

    /// A network share is already mounted at this path.
    #[error("network share already exists: {0}")]
    NetworkShareAlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The remote host rejected the supplied credentials.
    #[error("authentication rejected by {0}")]
    CredentialError(String),

    /// The remote host could not be reached.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// A network or daemon operation did not finish in time.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// A child process exited unsuccessfully.
    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Create an OperationNotAllowed error.
    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::OperationNotAllowed(msg.into())
    }

    /// Create a Command error.
    pub fn command(program: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OperationNotAllowed(_) | Self::NotADirectory(_) => "operation-not-allowed",
            Self::ShareAlreadyExists(_) => "share-already-exists",
            Self::NetworkShareAlreadyExists(_) => "network-share-already-exists",
            Self::CredentialError(_) => "credential-error",
            Self::NetworkUnreachable(_) => "network-unreachable",
            Self::Timeout { .. } => "timeout",
            Self::Command { .. } | Self::Store(_) | Self::Io(_) => "internal",
        }
    }

    /// True for failures caused by the remote side rather than this host.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::CredentialError(_) | Self::NetworkUnreachable(_) | Self::Timeout { .. }
        )
    }
}

/// Resolver rejections are security classification failures.
impl From<PathError> for StorageError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::Io(e) => Self::Io(e),
            other => Self::OperationNotAllowed(other.to_string()),
        }
    }
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;
