//! Error types for tdbkv
//!
//! Provides a unified error type for all operations, plus the coarse
//! [`ErrorKind`] that a handle remembers as its "last error".

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using TdbError
pub type Result<T> = std::result::Result<T, TdbError>;

/// Unified error type for tdbkv operations
#[derive(Debug, Error)]
pub enum TdbError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a valid database file: {0}")]
    BadFormat(String),

    #[error("Database is opened read-only")]
    ReadOnly,

    #[error("Database {0} is already open in this process")]
    AlreadyOpen(PathBuf),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt database: {0}")]
    Corrupt(String),

    #[error("Out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    // -------------------------------------------------------------------------
    // Record Errors
    // -------------------------------------------------------------------------
    #[error("Record exists")]
    RecordExists,

    #[error("Record does not exist")]
    RecordNotFound,

    // -------------------------------------------------------------------------
    // Locking Errors
    // -------------------------------------------------------------------------
    #[error("Locking error: {0}")]
    LockFailed(String),

    #[error("Lock timeout")]
    LockTimeout,

    #[error("Lock exists on other keys")]
    NoLockOnSomeChains,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TdbError {
    /// The coarse error kind recorded as a handle's last error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TdbError::Io(_)
            | TdbError::BadFormat(_)
            | TdbError::ReadOnly
            | TdbError::AlreadyOpen(_)
            | TdbError::Config(_) => ErrorKind::Io,
            TdbError::Corrupt(_) => ErrorKind::Corrupt,
            TdbError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            TdbError::RecordExists => ErrorKind::RecordExists,
            TdbError::RecordNotFound => ErrorKind::RecordNotFound,
            TdbError::LockFailed(_) => ErrorKind::LockFailed,
            TdbError::LockTimeout => ErrorKind::LockTimeout,
            TdbError::NoLockOnSomeChains => ErrorKind::NoLockOnSomeChains,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        TdbError::Corrupt(msg.into())
    }
}

/// Error taxonomy remembered per handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    Success,
    Corrupt,
    Io,
    LockFailed,
    LockTimeout,
    OutOfMemory,
    RecordExists,
    NoLockOnSomeChains,
    RecordNotFound,
}

impl ErrorKind {
    /// Fixed descriptive string for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::Corrupt => "Corrupt database",
            ErrorKind::Io => "IO Error",
            ErrorKind::LockFailed => "Locking error",
            ErrorKind::LockTimeout => "Lock timeout",
            ErrorKind::OutOfMemory => "Out of memory",
            ErrorKind::RecordExists => "Record exists",
            ErrorKind::NoLockOnSomeChains => "Lock exists on other keys",
            ErrorKind::RecordNotFound => "Record does not exist",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
