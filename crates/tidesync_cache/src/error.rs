//! Error types for cache operations.

use thiserror::Error;
use tidesync_store::StoreError;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed. The cache retains its last-known-good
    /// in-memory state.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A persisted record could not be decoded. Only the named record
    /// is affected.
    #[error("malformed record {key:?}: {message}")]
    Decode {
        /// Composite key of the malformed record.
        key: String,
        /// Decoder diagnostic.
        message: String,
    },

    /// A record could not be encoded for persistence.
    #[error("failed to encode record {key:?}: {message}")]
    Encode {
        /// Composite key of the record.
        key: String,
        /// Encoder diagnostic.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_record() {
        let err = CacheError::Decode {
            key: "QUERY_ROOT.post".into(),
            message: "truncated".into(),
        };
        assert!(err.to_string().contains("QUERY_ROOT.post"));
    }
}
