/// Error types for the mmdbmerge library
use std::fmt;

use crate::mmdb::MmdbError;

/// Result type alias for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;

/// Main error type for merge operations
///
/// Variants follow the failure classes of the engine: configuration
/// problems surface before any iteration begins, everything else aborts
/// the merge on first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Configuration errors (unknown database reference, bad path
    /// segment, mixed IP versions)
    Config(String),

    /// I/O errors
    Io(String),

    /// MMDB format or record decode errors
    Format(String),

    /// Path navigation errors (segment kind mismatched to node kind)
    Path(String),

    /// Two columns target the same output path with incompatible shapes
    FieldConflict(String),

    /// The merge was cancelled by the caller
    Cancelled,
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Config(msg) => write!(f, "configuration error: {}", msg),
            MergeError::Io(msg) => write!(f, "I/O error: {}", msg),
            MergeError::Format(msg) => write!(f, "format error: {}", msg),
            MergeError::Path(msg) => write!(f, "path error: {}", msg),
            MergeError::FieldConflict(msg) => write!(f, "field conflict: {}", msg),
            MergeError::Cancelled => write!(f, "merge cancelled"),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<std::io::Error> for MergeError {
    fn from(err: std::io::Error) -> Self {
        MergeError::Io(err.to_string())
    }
}

impl From<MmdbError> for MergeError {
    fn from(err: MmdbError) -> Self {
        MergeError::Format(err.to_string())
    }
}

impl From<csv::Error> for MergeError {
    fn from(err: csv::Error) -> Self {
        MergeError::Io(err.to_string())
    }
}
