//! Error types for table operations.

use std::io;
use thiserror::Error;

/// Result type for table operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during table operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted log is corrupted.
    #[error("table corrupted: {0}")]
    Corrupted(String),

    /// A key exceeded the maximum encodable length.
    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge {
        /// The offending key length.
        len: usize,
        /// The maximum supported length.
        max: usize,
    },

    /// A value exceeded the maximum encodable length.
    #[error("value too large: {len} bytes (max {max})")]
    ValueTooLarge {
        /// The offending value length.
        len: usize,
        /// The maximum supported length.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::Corrupted("truncated record".into());
        assert_eq!(err.to_string(), "table corrupted: truncated record");

        let err = StoreError::KeyTooLarge { len: 10, max: 4 };
        assert!(err.to_string().contains("10"));
    }
}
