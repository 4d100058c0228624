//! Last-sync bookkeeping.
//!
//! Each sync session is identified by the fingerprint of its query
//! trio; the store maps fingerprints to the wall-clock time of the
//! last successfully applied result. Coordinators consult it to pick
//! between a full base query and a cheap delta query.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidesync_protocol::Fingerprint;
use tidesync_store::KeyValueTable;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Persistent map from session fingerprint to last-sync time.
#[derive(Clone)]
pub struct SyncMetadataStore {
    table: Arc<dyn KeyValueTable>,
}

impl SyncMetadataStore {
    /// Wraps a key-value table.
    pub fn new(table: Arc<dyn KeyValueTable>) -> Self {
        Self { table }
    }

    /// The recorded last-sync time for `fingerprint`, if any.
    pub fn last_sync(&self, fingerprint: &Fingerprint) -> EngineResult<Option<SystemTime>> {
        let Some(bytes) = self.table.get(fingerprint.as_str())? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            EngineError::Protocol(format!(
                "last-sync entry for {fingerprint} has length {}, expected 8",
                bytes.len()
            ))
        })?;
        let millis = u64::from_le_bytes(raw);
        Ok(Some(UNIX_EPOCH + Duration::from_millis(millis)))
    }

    /// Records `time` as the last-sync time for `fingerprint`.
    pub fn set_last_sync(&self, fingerprint: &Fingerprint, time: SystemTime) -> EngineResult<()> {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        debug!(%fingerprint, millis, "recording last sync time");
        self.table
            .put(fingerprint.as_str(), &millis.to_le_bytes())?;
        Ok(())
    }

    /// Drops every recorded fingerprint. Subsequent sessions fall back
    /// to a full base query.
    pub fn clear(&self) -> EngineResult<()> {
        self.table.clear()?;
        Ok(())
    }
}
