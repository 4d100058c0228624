//! Structured conflict indication.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The server's view of state that caused a conditional write to be
/// rejected.
///
/// Transports are required to map a backend conflict rejection into
/// this type. Detecting conflicts by matching substrings of error
/// messages is explicitly not supported; it tied earlier clients to
/// backend wording and broke silently when that wording changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictState {
    /// The server's current state for the contested entity.
    pub server_state: Value,
}

impl ConflictState {
    /// Creates a conflict carrying the server's current state.
    #[must_use]
    pub fn new(server_state: Value) -> Self {
        Self { server_state }
    }
}
