//! Records, record sets and key projection.

use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Composite key addressing one decomposed record, derived from the
/// path used to reach it (e.g. `"QUERY_ROOT.posts.0"`).
pub type CacheKey = String;

/// Set of field-level keys (`"<record key>.<field>"`) whose stored
/// value changed during a merge.
pub type ChangedKeys = BTreeSet<String>;

/// A flat map from field name to value.
///
/// Nested objects never appear inline; decomposition replaces them with
/// [`FieldValue::Reference`] entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a field.
    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.fields.insert(field.into(), value);
    }

    /// Returns the value of `field`, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Iterates over fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Collects every record key referenced by this record's fields.
    #[must_use]
    pub fn references(&self) -> Vec<&CacheKey> {
        let mut out = Vec::new();
        for value in self.fields.values() {
            value.collect_references(&mut out);
        }
        out
    }

    /// Merges `incoming` into this record: fields present in `incoming`
    /// replace the stored field; absent fields are untouched. Returns
    /// the field names whose value changed.
    pub fn merge(&mut self, incoming: &Record) -> Vec<String> {
        let mut changed = Vec::new();
        for (field, value) in &incoming.fields {
            let is_change = self.fields.get(field) != Some(value);
            if is_change {
                self.fields.insert(field.clone(), value.clone());
                changed.push(field.clone());
            }
        }
        changed
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// A collection of records keyed by composite key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordSet {
    records: BTreeMap<CacheKey, Record>,
}

impl RecordSet {
    /// Creates an empty record set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record stored under `key`.
    pub fn insert(&mut self, key: impl Into<CacheKey>, record: Record) {
        self.records.insert(key.into(), record);
    }

    /// Returns the record stored under `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Iterates over records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &Record)> {
        self.records.iter()
    }

    /// Consumes the set, yielding records in key order.
    pub fn into_iter(self) -> impl Iterator<Item = (CacheKey, Record)> {
        self.records.into_iter()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the set holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<(CacheKey, Record)> for RecordSet {
    fn from_iter<I: IntoIterator<Item = (CacheKey, Record)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Projects field-level changed keys to record-level keys by stripping
/// the trailing field component. Used to decide which records need
/// re-reading after a merge.
#[must_use]
pub fn record_keys(field_keys: &ChangedKeys) -> BTreeSet<CacheKey> {
    field_keys
        .iter()
        .map(|field_key| match field_key.rfind('.') {
            Some(idx) => field_key[..idx].to_owned(),
            None => field_key.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_only_present_fields() {
        let mut stored: Record = [
            ("a".to_owned(), FieldValue::Int(1)),
            ("b".to_owned(), FieldValue::Int(2)),
        ]
        .into_iter()
        .collect();

        let incoming: Record = [("b".to_owned(), FieldValue::Int(3))].into_iter().collect();

        let changed = stored.merge(&incoming);
        assert_eq!(changed, vec!["b".to_owned()]);
        assert_eq!(stored.get("a"), Some(&FieldValue::Int(1)));
        assert_eq!(stored.get("b"), Some(&FieldValue::Int(3)));
    }

    #[test]
    fn merge_of_equal_value_reports_no_change() {
        let mut stored: Record = [("a".to_owned(), FieldValue::Int(1))].into_iter().collect();
        let incoming = stored.clone();
        assert!(stored.merge(&incoming).is_empty());
    }

    #[test]
    fn record_key_projection_strips_field() {
        let mut changed = ChangedKeys::new();
        changed.insert("QUERY_ROOT.posts.0.title".into());
        changed.insert("QUERY_ROOT.posts.0.body".into());
        changed.insert("QUERY_ROOT".into());

        let keys = record_keys(&changed);
        assert!(keys.contains("QUERY_ROOT.posts.0"));
        assert!(keys.contains("QUERY_ROOT"));
        assert_eq!(keys.len(), 2);
    }
}
