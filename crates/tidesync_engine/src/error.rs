//! Error types for the synchronization engine.

use std::time::Duration;

use thiserror::Error;
use tidesync_cache::CacheError;
use tidesync_protocol::ConflictState;
use tidesync_store::StoreError;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the mutation queue, sync coordinator and
/// subscription multiplexer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A request failed at the transport layer.
    ///
    /// `status` is `None` for connectivity failures where no response was
    /// received at all. `retry_after` carries an explicit server backoff
    /// hint when one was present.
    #[error("transport failure: {message}")]
    Transport {
        /// Human-readable description of the failure.
        message: String,
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Server-provided minimum wait before retrying.
        retry_after: Option<Duration>,
    },

    /// The server rejected a mutation because its precondition no longer
    /// holds. Carries the server's current view of the object.
    #[error("mutation conflict: server state diverged")]
    Conflict(ConflictState),

    /// Authentication or authorization failed. Never retried.
    #[error("authentication failure: {0}")]
    Authentication(String),

    /// A response could not be interpreted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operation or session was configured inconsistently.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The backing key-value store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The normalized cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl EngineError {
    /// Builds a connectivity-level transport failure (no response received).
    pub fn connectivity(message: impl Into<String>) -> Self {
        EngineError::Transport {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Builds a transport failure carrying an HTTP status code.
    pub fn transport_status(message: impl Into<String>, status: u16) -> Self {
        EngineError::Transport {
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Attaches a server-provided retry-after hint to a transport failure.
    /// No-op for other variants.
    #[must_use]
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        if let EngineError::Transport { retry_after, .. } = &mut self {
            *retry_after = Some(wait);
        }
        self
    }

    /// Whether retrying this failure could plausibly succeed.
    ///
    /// Connectivity failures, server errors (5xx) and throttling (429) are
    /// retryable. Client errors, authentication failures and conflicts are
    /// not: repeating the identical request would fail the identical way.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { status, retry_after, .. } => {
                if retry_after.is_some() {
                    return true;
                }
                match status {
                    None => true,
                    Some(code) => *code == 429 || (500..=599).contains(code),
                }
            }
            _ => false,
        }
    }

    /// The server's retry-after hint, if this failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_is_retryable() {
        assert!(EngineError::connectivity("socket closed").is_retryable());
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(EngineError::transport_status("oops", 500).is_retryable());
        assert!(EngineError::transport_status("oops", 503).is_retryable());
        assert!(EngineError::transport_status("slow down", 429).is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!EngineError::transport_status("bad request", 400).is_retryable());
        assert!(!EngineError::transport_status("not found", 404).is_retryable());
    }

    #[test]
    fn auth_and_conflict_are_never_retryable() {
        assert!(!EngineError::Authentication("expired token".into()).is_retryable());
        let state = ConflictState::new(serde_json::json!({"version": 3}));
        assert!(!EngineError::Conflict(state).is_retryable());
    }

    #[test]
    fn retry_after_forces_retryability() {
        let err = EngineError::transport_status("ddos guard", 403)
            .with_retry_after(Duration::from_secs(2));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
