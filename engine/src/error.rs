//! Error types for the export engine.
//!
//! `EngineError` covers failures that prevent an export from running at all
//! (unreachable sources, invalid requests, a destination that cannot be
//! reached). `DriverError` is the vocabulary every transfer driver translates
//! its transport failures into. Per-file problems during the transfer loop are
//! recorded in the `ExportReport`, never returned as errors.
//!
//! Both error types collapse into a `ResultCode`, which is what the host
//! ultimately sees.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Final status of an export operation, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    UserCanceled,
    /// Authentication or permission failure
    AccessDenied,
    PathNotFound,
    DiskFull,
    FileAlreadyExists,
    Unknown,
}

impl ResultCode {
    /// Map an I/O error onto the engine's result vocabulary.
    pub fn from_io(err: &io::Error) -> Self {
        if is_disk_full(err) {
            return ResultCode::DiskFull;
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => ResultCode::AccessDenied,
            io::ErrorKind::NotFound => ResultCode::PathNotFound,
            io::ErrorKind::AlreadyExists => ResultCode::FileAlreadyExists,
            _ => ResultCode::Unknown,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Success => "success",
            ResultCode::UserCanceled => "canceled by user",
            ResultCode::AccessDenied => "access denied",
            ResultCode::PathNotFound => "path not found",
            ResultCode::DiskFull => "disk full",
            ResultCode::FileAlreadyExists => "file already exists",
            ResultCode::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

#[cfg(unix)]
fn is_disk_full(err: &io::Error) -> bool {
    // ENOSPC
    err.raw_os_error() == Some(28)
}

#[cfg(windows)]
fn is_disk_full(err: &io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    matches!(err.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full(_err: &io::Error) -> bool {
    false
}

/// Errors that stop an export before or outside the per-file loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Source media not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid settings: {message}")]
    InvalidSettings { message: String },

    #[error("Operation is not in a state that allows this: {message}")]
    InvalidState { message: String },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Engine error: {message}")]
    Unknown { message: String },
}

impl EngineError {
    /// The result code the host should see for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::SourceNotFound { .. } => ResultCode::PathNotFound,
            Self::InvalidPath { .. } | Self::InvalidSettings { .. } | Self::InvalidState { .. } => {
                ResultCode::Unknown
            }
            Self::EnumerationFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => ResultCode::from_io(source),
            Self::Driver(err) => err.result_code(),
            Self::Unknown { .. } => ResultCode::Unknown,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Unknown {
            message: err.to_string(),
        }
    }
}

/// Failures reported by a `TransferDriver`.
///
/// Protocol-specific details stay in the message text; callers only branch on
/// the variant.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Cannot connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Access denied by {endpoint}: {message}")]
    AccessDenied { endpoint: String, message: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Cannot create directory {path}: {message}")]
    DirectoryCreation { path: String, message: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("Transfer canceled")]
    Cancelled,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl DriverError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Connect { .. } | Self::NotConnected | Self::Transfer { .. } => ResultCode::Unknown,
            Self::AccessDenied { .. } => ResultCode::AccessDenied,
            Self::DirectoryCreation { .. } => ResultCode::AccessDenied,
            Self::NotFound { .. } => ResultCode::PathNotFound,
            Self::Cancelled => ResultCode::UserCanceled,
            Self::Io { source, .. } => ResultCode::from_io(source),
        }
    }

    /// True for failures that end the session rather than a single request.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::AccessDenied { .. } | Self::NotConnected
        )
    }

    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        DriverError::Io {
            path: path.into(),
            source,
        }
    }
}
