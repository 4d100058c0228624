//! Response and message envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidesync_cache::RecordSet;

/// Result of a network query execution.
///
/// Carries both the raw JSON payload for the caller and the decomposed
/// records destined for the normalized cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The response payload.
    pub data: Value,
    /// Decomposed records to merge into the cache.
    pub records: RecordSet,
}

impl QueryResponse {
    /// Creates a response with no cache records.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            records: RecordSet::new(),
        }
    }

    /// Attaches decomposed records.
    #[must_use]
    pub fn with_records(mut self, records: RecordSet) -> Self {
        self.records = records;
        self
    }
}

/// Result of a successful mutation execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    /// The response payload.
    pub data: Value,
    /// Decomposed records to merge into the cache.
    pub records: RecordSet,
}

impl MutationResponse {
    /// Creates a response with no cache records.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            records: RecordSet::new(),
        }
    }

    /// Attaches decomposed records.
    #[must_use]
    pub fn with_records(mut self, records: RecordSet) -> Self {
        self.records = records;
        self
    }
}

/// A message delivered over the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// The topic this message arrived on.
    pub topic: String,
    /// The message payload.
    pub data: Value,
    /// Decomposed records to merge into the cache.
    pub records: RecordSet,
}

impl SubscriptionMessage {
    /// Creates a message with no cache records.
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            records: RecordSet::new(),
        }
    }

    /// Attaches decomposed records.
    #[must_use]
    pub fn with_records(mut self, records: RecordSet) -> Self {
        self.records = records;
        self
    }
}

/// Reference to an out-of-band binary object attached to a mutation.
///
/// The engine persists and replays this descriptor opaquely; the upload
/// itself is performed by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Storage bucket.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Storage region.
    pub region: String,
    /// Local file path of the pending upload.
    pub local_uri: String,
    /// MIME type of the object.
    pub mime_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_roundtrips() {
        let msg = SubscriptionMessage::new("topic-1", json!({ "id": 7 }));
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: SubscriptionMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
