//! Error types for the protocol crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error type covering malformed form input and shortcut records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A required form field was absent or empty.
    #[error("missing form field: {0}")]
    MissingField(&'static str),

    /// The shortcut record has no `URL=` entry.
    #[error("shortcut has no URL entry")]
    MissingUrl,

    /// The shortcut record is in a layout we cannot read (e.g. a binary plist).
    #[error("unsupported shortcut layout: {0}")]
    UnsupportedShortcut(String),

    /// The embedded URL failed to parse or uses a scheme we refuse to redirect to.
    #[error("invalid shortcut url: {0}")]
    InvalidUrl(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Machine-readable error codes reported to the caller.
///
/// These are the signals the request layer expects from the engine:
/// access denied, not found, write integrity failure, plain I/O failure
/// and the configuration class used only during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Sandbox violation.
    AccessDenied,
    /// Write attempted by a read-only caller.
    ReadOnly,
    /// Missing path or unreadable attributes.
    NotFound,
    /// Target already exists.
    AlreadyExists,
    /// Malformed or empty input.
    InvalidRequest,
    /// Temp file size did not match the submitted content.
    WriteIntegrity,
    /// Rename across filesystem boundaries.
    CrossDevice,
    /// Payload exceeds a configured limit.
    TooLarge,
    /// Read/write/rename failure.
    Io,
    /// Missing or wrong credentials.
    Unauthorized,
    /// Client address locked out after repeated failed logins.
    Banned,
    /// Startup configuration failure.
    Config,
}

impl ErrorCode {
    /// Returns the snake_case wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::ReadOnly => "read_only",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::WriteIntegrity => "write_integrity",
            ErrorCode::CrossDevice => "cross_device",
            ErrorCode::TooLarge => "too_large",
            ErrorCode::Io => "io",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Banned => "banned",
            ErrorCode::Config => "config",
        }
    }

    /// Whether a request failing with this code leaves the process healthy.
    ///
    /// Only configuration errors are fatal, and they can only occur at startup.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorCode::Config)
    }
}
