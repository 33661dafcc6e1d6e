//! Error types for StrataKV
//!
//! Mirrors the status taxonomy every layer reports: not-found, corruption,
//! I/O failure, and invalid arguments.

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for StrataKV operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    NotFound,

    // -------------------------------------------------------------------------
    // Data integrity
    // -------------------------------------------------------------------------
    #[error("Corruption: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IoMessage(String),

    // -------------------------------------------------------------------------
    // Caller errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Message used when a compaction is cut short by shutdown
pub(crate) const SHUTDOWN_COMPACTION: &str = "Deleting DB during compaction";

/// Message used when a memtable flush is cut short by shutdown
pub(crate) const SHUTDOWN_MEMTABLE: &str = "Deleting DB during memtable compaction";

/// Message used when a whole-file expiry is cut short by shutdown
pub(crate) const SHUTDOWN_EXPIRY: &str = "Deleting DB during expiry compaction";

impl StrataError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        StrataError::Corruption(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        StrataError::InvalidArgument(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        StrataError::IoMessage(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound)
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StrataError::Corruption(_))
    }

    /// True for the expected aborts raised while the database is closing
    pub fn is_shutdown_abort(&self) -> bool {
        match self {
            StrataError::IoMessage(msg) => {
                msg == SHUTDOWN_COMPACTION || msg == SHUTDOWN_MEMTABLE || msg == SHUTDOWN_EXPIRY
            }
            _ => false,
        }
    }
}

// A latched background error is handed to every later writer, so it must be
// cloneable; `std::io::Error` is not, so it degrades to its message.
impl Clone for StrataError {
    fn clone(&self) -> Self {
        match self {
            StrataError::NotFound => StrataError::NotFound,
            StrataError::Corruption(m) => StrataError::Corruption(m.clone()),
            StrataError::Io(e) => StrataError::IoMessage(e.to_string()),
            StrataError::IoMessage(m) => StrataError::IoMessage(m.clone()),
            StrataError::InvalidArgument(m) => StrataError::InvalidArgument(m.clone()),
        }
    }
}
