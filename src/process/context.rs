//! Process Context
//!
//! A string-keyed JSON bag owned by one process. Handlers read a snapshot
//! of it and object results are merged back in after they succeed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shared data for one process.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Context {
    data: Map<String, Value>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context from initial data.
    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Gets a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Gets a string value by key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Sets a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    /// Merges `other` into this context; keys in `other` win.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            self.data.insert(key, value);
        }
    }

    /// Borrows the underlying map.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Returns the number of keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the context holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let mut ctx = Context::new();
        assert!(ctx.is_empty());

        ctx.insert("customer", json!("acme"));
        assert_eq!(ctx.get_str("customer"), Some("acme"));
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = Context::new();
        ctx.insert("a", json!(1));
        ctx.insert("b", json!(2));

        let update = json!({"b": 20, "c": 30});
        ctx.merge(update.as_object().cloned().unwrap());

        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get("b"), Some(&json!(20)));
        assert_eq!(ctx.get("c"), Some(&json!(30)));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut ctx = Context::new();
        ctx.insert("k", json!("v"));
        assert_eq!(serde_json::to_string(&ctx).unwrap(), r#"{"k":"v"}"#);
    }
}
