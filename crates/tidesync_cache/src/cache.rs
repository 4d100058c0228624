//! Normalized cache trait and implementations.

use crate::error::{CacheError, CacheResult};
use crate::record::{CacheKey, ChangedKeys, Record, RecordSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tidesync_store::KeyValueTable;
use tracing::{debug, warn};

/// A merge-based, reference-following store of decomposed query results.
///
/// Merges serialize against each other; loads may proceed concurrently
/// with other loads and never observe a partially applied merge.
pub trait NormalizedCache: Send + Sync {
    /// Atomically applies `incoming` and returns every field-level key
    /// whose stored value changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails; the cache then
    /// remains in its last-known-good state.
    fn merge(&self, incoming: RecordSet) -> CacheResult<ChangedKeys>;

    /// Returns the records stored under `keys`, preserving input order,
    /// with `None` for absent keys.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Decode`] naming the first requested record
    /// whose persisted bytes are malformed; unrelated records are not
    /// affected.
    fn load(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Record>>>;

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be cleared.
    fn clear(&self) -> CacheResult<()>;

    /// Loads the transitive closure of records reachable from `root`
    /// by following references. Returns an empty set if `root` is
    /// absent. Cycles are visited once.
    ///
    /// # Errors
    ///
    /// Propagates load failures.
    fn resolve(&self, root: &str) -> CacheResult<RecordSet> {
        let mut out = RecordSet::new();
        let mut visited: BTreeSet<CacheKey> = BTreeSet::new();
        let mut frontier: VecDeque<CacheKey> = VecDeque::new();
        frontier.push_back(root.to_owned());
        visited.insert(root.to_owned());

        while let Some(key) = frontier.pop_front() {
            let mut loaded = self.load(std::slice::from_ref(&key))?;
            let Some(record) = loaded.pop().flatten() else {
                continue;
            };
            for reference in record.references() {
                if visited.insert(reference.clone()) {
                    frontier.push_back(reference.clone());
                }
            }
            out.insert(key, record);
        }

        Ok(out)
    }
}

/// An in-memory normalized cache, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: RwLock<BTreeMap<CacheKey, Record>>,
}

impl MemoryCache {
    /// Creates a new empty in-memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NormalizedCache for MemoryCache {
    fn merge(&self, incoming: RecordSet) -> CacheResult<ChangedKeys> {
        let mut records = self.records.write();
        let mut changed = ChangedKeys::new();
        for (key, record) in incoming.into_iter() {
            match records.get_mut(&key) {
                Some(stored) => {
                    for field in stored.merge(&record) {
                        changed.insert(format!("{key}.{field}"));
                    }
                }
                None => {
                    let mut stored = Record::default();
                    let changed_fields = stored.merge(&record);
                    // A change-free record for an unknown key stores
                    // nothing; loads keep answering None for it.
                    if !changed_fields.is_empty() {
                        for field in changed_fields {
                            changed.insert(format!("{key}.{field}"));
                        }
                        records.insert(key, stored);
                    }
                }
            }
        }
        Ok(changed)
    }

    fn load(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Record>>> {
        let records = self.records.read();
        Ok(keys.iter().map(|key| records.get(key).cloned()).collect())
    }

    fn clear(&self) -> CacheResult<()> {
        self.records.write().clear();
        Ok(())
    }
}

/// One decoded (or undecodable) persisted record.
#[derive(Debug, Clone)]
enum Slot {
    Ok(Record),
    Malformed(String),
}

/// A normalized cache persisted through a [`KeyValueTable`].
///
/// Records are encoded as CBOR. The table is scanned once on open; a
/// record that fails to decode is retained as a poisoned slot so that
/// loading it surfaces [`CacheError::Decode`] while merges of unrelated
/// records proceed normally. Merging over a poisoned slot replaces it
/// wholesale with the incoming record.
///
/// On a store write failure mid-merge the in-memory view is left
/// untouched, so readers keep seeing the last-known-good state; the
/// partially written table is reconciled on next open.
pub struct TableCache<T: KeyValueTable> {
    table: T,
    slots: RwLock<BTreeMap<CacheKey, Slot>>,
}

impl<T: KeyValueTable> TableCache<T> {
    /// Opens a cache over `table`, decoding any persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be scanned. Individual
    /// malformed records do not fail the open.
    pub fn open(table: T) -> CacheResult<Self> {
        let mut slots = BTreeMap::new();
        for (key, bytes) in table.scan()? {
            match ciborium::from_reader::<Record, _>(bytes.as_slice()) {
                Ok(record) => {
                    slots.insert(key, Slot::Ok(record));
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "persisted record failed to decode");
                    slots.insert(key, Slot::Malformed(err.to_string()));
                }
            }
        }
        debug!(records = slots.len(), "opened table cache");
        Ok(Self {
            table,
            slots: RwLock::new(slots),
        })
    }

    fn encode(key: &str, record: &Record) -> CacheResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(record, &mut buf).map_err(|err| CacheError::Encode {
            key: key.to_owned(),
            message: err.to_string(),
        })?;
        Ok(buf)
    }
}

impl<T: KeyValueTable> NormalizedCache for TableCache<T> {
    fn merge(&self, incoming: RecordSet) -> CacheResult<ChangedKeys> {
        let mut slots = self.slots.write();

        // Stage the post-merge state without touching the live map, so
        // an encode or store failure leaves last-known-good intact.
        let mut staged: Vec<(CacheKey, Record, Vec<String>)> = Vec::new();
        for (key, record) in incoming.into_iter() {
            let (merged, changed_fields) = match slots.get(&key) {
                Some(Slot::Ok(stored)) => {
                    let mut merged = stored.clone();
                    let changed = merged.merge(&record);
                    (merged, changed)
                }
                // A poisoned or absent slot takes the incoming record
                // wholesale; every incoming field counts as changed.
                _ => {
                    let changed = record.iter().map(|(f, _)| f.clone()).collect();
                    (record, changed)
                }
            };
            if !changed_fields.is_empty() {
                staged.push((key, merged, changed_fields));
            }
        }

        let mut encoded = Vec::with_capacity(staged.len());
        for (key, merged, _) in &staged {
            encoded.push(Self::encode(key, merged)?);
        }
        for ((key, _, _), bytes) in staged.iter().zip(&encoded) {
            self.table.put(key, bytes)?;
        }

        let mut changed = ChangedKeys::new();
        for (key, merged, changed_fields) in staged {
            for field in changed_fields {
                changed.insert(format!("{key}.{field}"));
            }
            slots.insert(key, Slot::Ok(merged));
        }
        Ok(changed)
    }

    fn load(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Record>>> {
        let slots = self.slots.read();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match slots.get(key) {
                Some(Slot::Ok(record)) => out.push(Some(record.clone())),
                Some(Slot::Malformed(message)) => {
                    return Err(CacheError::Decode {
                        key: key.clone(),
                        message: message.clone(),
                    });
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn clear(&self) -> CacheResult<()> {
        let mut slots = self.slots.write();
        self.table.clear()?;
        slots.clear();
        Ok(())
    }
}
