//! In-memory table for testing and ephemeral stores.

use crate::error::StoreResult;
use crate::table::KeyValueTable;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory key/value table.
///
/// This table stores all data in memory and is suitable for:
/// - Unit tests
/// - Stores configured without a backing file (lost on restart)
///
/// # Thread Safety
///
/// This table is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use tidesync_store::{KeyValueTable, MemoryTable};
///
/// let table = MemoryTable::new();
/// table.put("k", b"v").unwrap();
/// assert_eq!(table.len().unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryTable {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryTable {
    /// Creates a new empty in-memory table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table pre-populated with entries.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl KeyValueTable for MemoryTable {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.entries.read().len())
    }
}
