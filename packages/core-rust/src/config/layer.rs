//! Flattened key/value layers and their precedence merge.
//!
//! Every source is flattened into a `ConfigLayer`: a sorted map of lowercase
//! dot-delimited leaf keys to JSON values. Layers are merged leaf by leaf,
//! later layers winning. Writing a leaf removes any lower-precedence entry
//! that is an ancestor or descendant of it, so the merged map always
//! describes a well-formed tree.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// A flattened configuration source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    entries: BTreeMap<String, Value>,
}

impl ConfigLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens a parsed document. Non-object roots produce an empty layer.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut layer = Self::new();
        if let Value::Object(map) = value {
            for (key, child) in map {
                flatten_into(&mut layer, &normalize_key(key), child);
            }
        }
        layer
    }

    /// Sets a value at `key`, flattening objects below it.
    pub fn set(&mut self, key: &str, value: Value) {
        flatten_into(self, &normalize_key(key), &value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&normalize_key(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` on top of `self`; `other` wins per key.
    pub fn merge(&mut self, other: &ConfigLayer) {
        for (key, value) in &other.entries {
            self.insert_leaf(key.clone(), value.clone());
        }
    }

    /// Rebuilds the nested document described by this layer.
    #[must_use]
    pub fn to_tree(&self) -> Value {
        let mut root = Map::new();
        for (key, value) in &self.entries {
            let mut node = &mut root;
            let mut parts = key.split('.').peekable();
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), value.clone());
                    break;
                }
                let child = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                let Some(map) = child.as_object_mut() else {
                    break;
                };
                node = map;
            }
        }
        Value::Object(root)
    }

    fn insert_leaf(&mut self, key: String, value: Value) {
        let descendant_prefix = format!("{key}.");
        self.entries
            .retain(|existing, _| !existing.starts_with(&descendant_prefix));
        let mut ancestor = key.as_str();
        while let Some(idx) = ancestor.rfind('.') {
            ancestor = &ancestor[..idx];
            self.entries.remove(ancestor);
        }
        self.entries.insert(key, value);
    }
}

fn flatten_into(layer: &mut ConfigLayer, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let child_key = format!("{prefix}.{}", normalize_key(key));
                flatten_into(layer, &child_key, child);
            }
        }
        other => layer.insert_leaf(prefix.to_string(), other.clone()),
    }
}

/// Keys are case-insensitive; the canonical form is lowercase.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Converts a raw string from the environment or command line into the
/// type of the value it overrides.
#[must_use]
pub fn coerce_like(raw: &str, existing: Option<&Value>) -> Value {
    match existing {
        Some(Value::Bool(_)) => raw
            .trim()
            .parse::<bool>()
            .map_or_else(|_| Value::String(raw.to_string()), Value::Bool),
        Some(Value::Number(n)) if n.is_f64() => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or_else(|| Value::String(raw.to_string()), Value::Number),
        Some(Value::Number(_)) => raw
            .trim()
            .parse::<i64>()
            .map_or_else(|_| Value::String(raw.to_string()), Value::from),
        Some(Value::String(_)) => Value::String(raw.to_string()),
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}
