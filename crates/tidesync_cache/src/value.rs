//! Field value type for normalized records.

use crate::record::CacheKey;
use serde::{Deserialize, Serialize};

/// A single field value inside a normalized [`crate::Record`].
///
/// Values are scalars, lists, or **references** to other records. The
/// serde representation is externally tagged, so a `Reference` encodes
/// as a distinct variant and can never collide with a `String` scalar
/// whose content happens to look like a cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Explicit null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Text scalar.
    String(String),
    /// A pointer to another record by composite key.
    Reference(CacheKey),
    /// An ordered list of values (possibly nested).
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Creates a reference to the record stored under `key`.
    pub fn reference(key: impl Into<CacheKey>) -> Self {
        FieldValue::Reference(key.into())
    }

    /// Returns the referenced key if this value is a reference.
    #[must_use]
    pub fn as_reference(&self) -> Option<&CacheKey> {
        match self {
            FieldValue::Reference(key) => Some(key),
            _ => None,
        }
    }

    /// Returns true if this value (or any element of a nested list)
    /// references another record.
    #[must_use]
    pub fn contains_reference(&self) -> bool {
        match self {
            FieldValue::Reference(_) => true,
            FieldValue::List(items) => items.iter().any(FieldValue::contains_reference),
            _ => false,
        }
    }

    /// Collects every key referenced by this value into `out`.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a CacheKey>) {
        match self {
            FieldValue::Reference(key) => out.push(key),
            FieldValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_roundtrips_distinct_from_string() {
        let reference = FieldValue::reference("QUERY_ROOT.post");
        let string = FieldValue::String("QUERY_ROOT.post".into());
        assert_ne!(reference, string);

        let mut buf = Vec::new();
        ciborium::into_writer(&reference, &mut buf).unwrap();
        let decoded: FieldValue = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded, reference);
        assert_ne!(decoded, string);

        let mut buf = Vec::new();
        ciborium::into_writer(&string, &mut buf).unwrap();
        let decoded: FieldValue = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(decoded, string);
        assert!(decoded.as_reference().is_none());
    }

    #[test]
    fn nested_list_references_are_found() {
        let value = FieldValue::List(vec![
            FieldValue::Int(1),
            FieldValue::List(vec![FieldValue::reference("a.b")]),
        ]);
        assert!(value.contains_reference());

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0], "a.b");
    }
}
