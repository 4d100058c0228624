//! Key/value table trait definition.

use crate::error::StoreResult;

/// A durable key/value table.
///
/// Tables are **opaque byte stores** keyed by UTF-8 strings. The engine
/// owns all record format interpretation - tables do not understand
/// mutation records, cache records, or sync metadata.
///
/// # Invariants
///
/// - `put` followed by `get` for the same key returns the stored bytes
/// - `put` on an existing key replaces its value
/// - `delete` is idempotent; deleting an absent key is not an error
/// - `scan` returns every live entry in ascending key order
/// - Once `put` or `delete` returns, the change is durable (for
///   persistent implementations)
///
/// # Implementors
///
/// - [`super::MemoryTable`] - For testing and in-memory-only stores
/// - [`super::FileTable`] - For persistent storage
pub trait KeyValueTable: Send + Sync {
    /// Returns the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Inserts or replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable, or if the
    /// key or value exceeds the implementation's size limits.
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Removes `key` and its value. Absent keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be made durable.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns all live entries in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn scan(&self) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Removes every entry from the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be cleared durably.
    fn clear(&self) -> StoreResult<()>;

    /// Returns the number of live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn len(&self) -> StoreResult<usize>;

    /// Returns true if the table holds no entries.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl<T: KeyValueTable + ?Sized> KeyValueTable for std::sync::Arc<T> {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }

    fn scan(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        (**self).scan()
    }

    fn clear(&self) -> StoreResult<()> {
        (**self).clear()
    }

    fn len(&self) -> StoreResult<usize> {
        (**self).len()
    }
}
