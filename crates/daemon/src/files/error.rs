//! Error type shared by every file operation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wfm_protocol::{ErrorCode, ProtocolError};

/// Errors that can occur during a file operation.
///
/// All variants are recoverable per request: the caller is told what went
/// wrong and other in-flight requests are unaffected.
#[derive(Debug, Error)]
pub enum FileError {
    /// The path falls under a denied prefix.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A write was attempted with read-only access.
    #[error("read only access")]
    ReadOnly,

    /// The path does not exist or its attributes cannot be read.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The target already exists and will not be replaced.
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// The name reduces to nothing usable (empty, `.`, `..`, `/`).
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// A save was submitted with no data.
    #[error("no data submitted")]
    EmptyContent,

    /// The temp file does not hold what we wrote; the final path was left alone.
    #[error(
        "write integrity check failed for {}: expected {expected} bytes, temp file has {actual}",
        .path.display()
    )]
    WriteIntegrity {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Rename across filesystems is not supported.
    #[error(
        "cannot move {} to {}: crosses a filesystem boundary",
        .from.display(),
        .to.display()
    )]
    CrossDevice { from: PathBuf, to: PathBuf },

    /// A directory was required.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A regular file was required.
    #[error("is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    /// Payload exceeds the configured limit.
    #[error("too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// The request is valid but cannot be served for this file.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Shortcut file content could not be resolved.
    #[error("shortcut: {0}")]
    Shortcut(#[from] ProtocolError),

    /// The archive listing capability failed.
    #[error("listing failed: {0}")]
    Listing(String),

    /// Underlying I/O failure.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    /// Wrap an I/O error, promoting the kinds callers care about.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(path),
            io::ErrorKind::AlreadyExists => FileError::AlreadyExists(path),
            _ => FileError::Io { op, path, source },
        }
    }

    /// The machine-readable code reported to the caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            FileError::AccessDenied(_) => ErrorCode::AccessDenied,
            FileError::ReadOnly => ErrorCode::ReadOnly,
            FileError::NotFound(_) => ErrorCode::NotFound,
            FileError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            FileError::InvalidName(_)
            | FileError::EmptyContent
            | FileError::NotADirectory(_)
            | FileError::IsADirectory(_)
            | FileError::Unsupported(_)
            | FileError::Shortcut(_) => ErrorCode::InvalidRequest,
            FileError::WriteIntegrity { .. } => ErrorCode::WriteIntegrity,
            FileError::CrossDevice { .. } => ErrorCode::CrossDevice,
            FileError::TooLarge { .. } => ErrorCode::TooLarge,
            FileError::Listing(_) | FileError::Io { .. } => ErrorCode::Io,
        }
    }
}
