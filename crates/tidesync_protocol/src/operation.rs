//! Graph-query operations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The kind of a graph-query operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// A point-in-time read.
    Query,
    /// A write.
    Mutation,
    /// A live feed over the real-time channel.
    Subscription,
}

/// An opaque graph-query operation: kind, name, request text and
/// variables.
///
/// The engine never interprets the text; it ships it to the transport
/// and keys cache and bookkeeping state off it. Variables are JSON;
/// their field order never affects fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Operation name, used for diagnostics.
    pub name: String,
    /// The request text.
    pub text: String,
    /// JSON variables object.
    pub variables: Value,
}

impl Operation {
    /// Creates a query operation with no variables.
    pub fn query(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(OperationKind::Query, name, text)
    }

    /// Creates a mutation operation with no variables.
    pub fn mutation(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(OperationKind::Mutation, name, text)
    }

    /// Creates a subscription operation with no variables.
    pub fn subscription(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(OperationKind::Subscription, name, text)
    }

    fn new(kind: OperationKind, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            text: text.into(),
            variables: json!({}),
        }
    }

    /// Sets the whole variables object.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Sets or replaces a single variable. This is how the delta query
    /// is parameterized with the last sync time.
    #[must_use]
    pub fn with_variable(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.variables.is_object() {
            self.variables = json!({});
        }
        if let Some(map) = self.variables.as_object_mut() {
            map.insert(key.to_owned(), value.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_variable_replaces() {
        let op = Operation::query("ListPosts", "query ListPosts { posts { id } }")
            .with_variable("limit", 10)
            .with_variable("limit", 20);
        assert_eq!(op.variables["limit"], 20);
    }

    #[test]
    fn kinds_are_distinct() {
        assert_ne!(OperationKind::Query, OperationKind::Subscription);
        let op = Operation::subscription("OnPost", "subscription OnPost { onPost { id } }");
        assert_eq!(op.kind, OperationKind::Subscription);
    }
}
