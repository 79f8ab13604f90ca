//! Error types for the HSD stream store.

use std::fmt;
use std::io;

use crate::codec::CodecError;

/// The result type used throughout HSD.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for HSD operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// On-disk data is structurally damaged and could not be repaired.
    Corruption(String),

    /// A stream, file or index entry was not found.
    NotFound(String),

    /// An invalid argument was provided.
    InvalidArgument(String),

    /// The stream or file is in a state that does not allow the operation.
    InvalidState(String),

    /// A codec or manifest (de)serialization failed.
    Serialization(String),

    /// A non-blocking lock is held by someone else. Retry later.
    Busy(String),

    /// A record exceeds the maximum frame length.
    RecordTooLarge {
        /// Size of the rejected record.
        size: usize,
        /// Largest accepted record size.
        max: usize,
    },

    /// A recomputed block hash does not match the stored one.
    HashMismatch {
        /// Global block number.
        block: u64,
        /// Stored hash, hex encoded.
        expected: String,
        /// Recomputed hash, hex encoded.
        actual: String,
    },

    /// The stream or file already exists.
    AlreadyExists(String),

    /// The pipeline was stopped by the fault-injection hook after the given
    /// write-flag stage became durable.
    Interrupted {
        /// Raw write-flag value that was persisted.
        stage: u8,
    },

    /// An internal error occurred.
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new busy error.
    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true when the operation failed only because a lock was taken.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Corruption(msg) => write!(f, "Data corruption: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Busy(msg) => write!(f, "Busy: {}", msg),
            Error::RecordTooLarge { size, max } => {
                write!(f, "Record too large: {} bytes (max {})", size, max)
            }
            Error::HashMismatch { block, expected, actual } => {
                write!(f, "Hash mismatch in block {}: expected {}, got {}", block, expected, actual)
            }
            Error::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Error::Interrupted { stage } => write!(f, "Interrupted after write-flag {}", stage),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Serialization(err.to_string())
    }
}
