//! Persistence error types.

use std::fmt;

/// Errors that can occur while writing or reading a snapshot.
#[derive(Debug)]
pub enum PersistenceError {
    /// IO error
    Io(std::io::Error),
    /// File does not start with the snapshot magic
    BadMagic,
    /// Snapshot format version this build cannot read
    UnsupportedVersion(u32),
    /// Truncated or inconsistent snapshot data
    Corrupt(String),
}

impl PersistenceError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::BadMagic => write!(f, "not a persistence snapshot (bad magic)"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {}", v),
            Self::Corrupt(e) => write!(f, "corrupt snapshot: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<tempfile::PersistError> for PersistenceError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;
