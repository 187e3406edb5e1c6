//! Engine error types.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use lode_common::LodeError;

/// Result type for engine internals.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised inside the storage engine.
///
/// Converted to [`LodeError`] at the trait boundary.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum EngineError {
    /// I/O error on the data file.
    #[error("engine I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// A complete record failed validation.
    #[error("corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },

    /// Checksum mismatch on a complete record.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        computed: u32,
    },

    /// Open options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The store does not exist and `create_if_missing` is off.
    #[error("store does not exist: {path} (create_if_missing is false)")]
    Missing { path: PathBuf },

    /// The store exists and `error_if_exists` is on.
    #[error("store already exists: {path} (error_if_exists is true)")]
    Exists { path: PathBuf },

    /// Another engine in this process has the store open.
    #[error("lock held on {path}: store already open")]
    Locked { path: PathBuf },

    /// Key or value exceeds the configured maximum.
    #[error("{what} too large: {size} bytes (max: {max})")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },

    /// A failed append left the data log in a state it could not undo.
    #[error("data log unusable: a failed write could not be rolled back")]
    LogUnusable,

    /// The engine was closed.
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true if the error indicates damaged data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::ChecksumMismatch { .. })
    }
}

impl From<EngineError> for LodeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Io { .. } | EngineError::Locked { .. } | EngineError::LogUnusable => {
                LodeError::Io(err.to_string())
            }
            EngineError::Corrupted { .. } | EngineError::ChecksumMismatch { .. } => {
                LodeError::Corruption(err.to_string())
            }
            EngineError::InvalidOptions(_)
            | EngineError::Missing { .. }
            | EngineError::Exists { .. }
            | EngineError::TooLarge { .. } => LodeError::InvalidArgument(err.to_string()),
            EngineError::Closed => LodeError::ResourceClosed,
        }
    }
}
