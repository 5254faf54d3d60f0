//! Error types for wire decoding

use thiserror::Error;

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when a payload violates its structural invariants
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended inside a record
    #[error("Truncated {what} at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// The header's batch count disagrees with the number of requested series
    #[error("Series count mismatch: requested {expected}, payload declares {found}")]
    CountMismatch { expected: usize, found: u64 },

    /// Bytes were left over after the last declared series
    #[error("Unexpected {count} trailing bytes at offset {offset}")]
    TrailingBytes { offset: usize, count: usize },

    /// A name or unit field was not valid UTF-8
    #[error("Invalid UTF-8 in {field} at offset {offset}")]
    InvalidText { field: &'static str, offset: usize },
}

impl Error {
    /// Create a truncation error
    pub fn truncated(what: &'static str, offset: usize, needed: usize, available: usize) -> Self {
        Error::Truncated {
            what,
            offset,
            needed,
            available,
        }
    }
}
