//! Deterministic sync-session fingerprints.

use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// A deterministic hash identifying one sync session: the combination
/// of base query, delta query and subscription (texts and variables).
///
/// Fingerprints key the persisted last-successful-sync-time store, so
/// they must be stable across process restarts and independent of JSON
/// field order in the variables. Computed once per coordinator and
/// immutable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint for a sync session. `delta` and
    /// `subscription` are optional because a session may run without
    /// either.
    #[must_use]
    pub fn of_session(
        base: &Operation,
        delta: Option<&Operation>,
        subscription: Option<&Operation>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hash_operation(&mut hasher, base);
        if let Some(delta) = delta {
            hash_operation(&mut hasher, delta);
        }
        if let Some(subscription) = subscription {
            hash_operation(&mut hasher, subscription);
        }
        Self(hex(&hasher.finalize()))
    }

    /// Computes the fingerprint of a single operation, used to derive
    /// subscription topics.
    #[must_use]
    pub fn of_operation(operation: &Operation) -> Self {
        let mut hasher = Sha256::new();
        hash_operation(&mut hasher, operation);
        Self(hex(&hasher.finalize()))
    }

    /// Returns the fingerprint as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_operation(hasher: &mut Sha256, operation: &Operation) {
    hasher.update(operation.text.as_bytes());
    hasher.update([0u8]);
    hash_value(hasher, &operation.variables);
    hasher.update([0u8]);
}

/// Hashes a JSON value with object keys visited in sorted order at
/// every level, so variables hash equal regardless of field order.
fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
