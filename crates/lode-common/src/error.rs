//! Error types shared across lode.
//!
//! [`LodeError`] is what every fallible lode operation returns. At the
//! request/reply boundary errors collapse to an [`ErrorKind`], which is
//! `Copy` and carries the stable numeric codes used by embedding runtimes.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for lode operations.
pub type LodeResult<T> = Result<T, LodeError>;

/// Protocol-level error kinds.
///
/// `NotFound` is never produced as an error by point reads (a miss is
/// reported as absence) but is kept so callers can map absence onto the
/// same code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key not present.
    NotFound,
    /// Underlying I/O failure.
    IoError,
    /// Stored data failed validation.
    Corruption,
    /// Catch-all for engine errors not otherwise classified.
    InvalidArgument,
    /// Operation attempted on a handle or cursor that was already finalized.
    ResourceClosed,
    /// Duplicate close of a handle.
    AlreadyClosed,
}

impl ErrorKind {
    /// Returns the numeric code for this kind.
    #[inline]
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::IoError => -2,
            Self::Corruption => -3,
            Self::InvalidArgument => -4,
            Self::NotFound => -5,
            Self::ResourceClosed => -6,
            Self::AlreadyClosed => -7,
        }
    }

    /// Returns the kind for a numeric code, if known.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(Self::IoError),
            -3 => Some(Self::Corruption),
            -4 => Some(Self::InvalidArgument),
            -5 => Some(Self::NotFound),
            -6 => Some(Self::ResourceClosed),
            -7 => Some(Self::AlreadyClosed),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for ErrorKind {}

/// The main error type for lode.
///
/// The error is `Clone` so a single open failure can be delivered to every
/// caller that was waiting on that open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LodeError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored data is corrupted.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Invalid argument, or an engine error with no finer classification.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle or cursor has already been finalized.
    #[error("resource closed")]
    ResourceClosed,

    /// The handle was already closed by this caller.
    #[error("already closed")]
    AlreadyClosed,
}

impl LodeError {
    /// Creates an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Creates a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Returns the protocol-level kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::IoError,
            Self::Corruption(_) => ErrorKind::Corruption,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ResourceClosed => ErrorKind::ResourceClosed,
            Self::AlreadyClosed => ErrorKind::AlreadyClosed,
        }
    }

    /// Returns true if the error reports a lifecycle that already ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ResourceClosed | Self::AlreadyClosed)
    }

    /// Returns true if the caller may reasonably retry the operation.
    ///
    /// Nothing is retried internally; this only informs caller policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<io::Error> for LodeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<LodeError> for ErrorKind {
    fn from(err: LodeError) -> Self {
        err.kind()
    }
}
