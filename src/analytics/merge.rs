//! Merge functions for combining already-materialized shard data.
//!
//! Counters are summed the same way `$inc` deltas are summed when coalescing
//! writes; unique-user arrays are unioned into sets. These operate on raw
//! `serde_json::Value` so shard documents never need a fixed Rust schema.

use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashSet};

/// Sum two counter trees key by key.
///
/// Objects merge recursively, numbers add, and any other combination takes `b`.
pub fn merge_counters(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut out = left.clone();
            merge_counter_maps(&mut out, right);
            Value::Object(out)
        }
        (Value::Number(x), Value::Number(y)) => add_numbers(x, y),
        (_, other) => other.clone(),
    }
}

/// In-place form of [`merge_counters`] for two objects.
pub fn merge_counter_maps(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match target.get_mut(key) {
            Some(existing) => {
                if existing.is_object() && value.is_object() {
                    if let (Some(inner), Some(extra)) = (existing.as_object_mut(), value.as_object()) {
                        merge_counter_maps(inner, extra);
                    }
                } else {
                    let merged = merge_counters(existing, value);
                    *existing = merged;
                }
            }
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn add_numbers(x: &Number, y: &Number) -> Value {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
        _ => {
            let sum = x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0);
            Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
        }
    }
}

/// Read a numeric field as i64, treating anything else as 0.
pub fn as_count(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Unique-user sets, possibly nested under dimension keys
/// (`byBrowserAndOsUniqueUsers.<browser>.<os>` is two levels deep).
#[derive(Debug, Clone, PartialEq)]
pub enum UserSets {
    Set(HashSet<String>),
    Nested(BTreeMap<String, UserSets>),
}

impl Default for UserSets {
    fn default() -> Self {
        UserSets::Nested(BTreeMap::new())
    }
}

impl UserSets {
    pub fn empty_set() -> Self {
        UserSets::Set(HashSet::new())
    }

    /// Union the arrays found in `value` into `self`, following nested objects.
    pub fn absorb(&mut self, value: &Value) {
        match value {
            Value::Array(items) => {
                if !matches!(self, UserSets::Set(_)) {
                    *self = UserSets::empty_set();
                }
                if let UserSets::Set(set) = self {
                    set.extend(items.iter().filter_map(|v| v.as_str()).map(str::to_string));
                }
            }
            Value::Object(map) => {
                if !matches!(self, UserSets::Nested(_)) {
                    *self = UserSets::default();
                }
                if let UserSets::Nested(children) = self {
                    for (key, child) in map {
                        children
                            .entry(key.clone())
                            .or_insert_with(|| match child {
                                Value::Array(_) => UserSets::empty_set(),
                                _ => UserSets::default(),
                            })
                            .absorb(child);
                    }
                }
            }
            // a single stored fingerprint still counts as one member
            Value::String(s) => {
                if !matches!(self, UserSets::Set(_)) {
                    *self = UserSets::empty_set();
                }
                if let UserSets::Set(set) = self {
                    set.insert(s.clone());
                }
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UserSets::Set(set) => set.len(),
            UserSets::Nested(children) => children.values().map(UserSets::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace each set by its cardinality, keeping the nesting.
    pub fn to_counts(&self) -> Value {
        match self {
            UserSets::Set(set) => Value::from(set.len() as u64),
            UserSets::Nested(children) => Value::Object(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_counts()))
                    .collect(),
            ),
        }
    }

    /// Cardinalities as a map; a bare set becomes an empty map.
    pub fn counts_map(&self) -> Map<String, Value> {
        match self.to_counts() {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Number of distinct members stored at `value` (array) or under it (object of arrays).
pub fn distinct_count(value: Option<&Value>) -> u64 {
    let mut sets = UserSets::empty_set();
    if let Some(v) = value {
        sets.absorb(v);
    }
    sets.len() as u64
}
