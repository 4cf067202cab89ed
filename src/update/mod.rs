//! Partial update documents applied to stat shards.
//!
//! An [`UpdateOps`] is the delta produced by one tracking event, or by several
//! coalesced events. It serializes to the operator document the store applies
//! (`{"$inc": {...}, "$set": {...}, ...}`).

pub mod merge;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PageMonitorError, Result};

pub use merge::merge;

/// Operator names accepted by [`UpdateOps::from_json`].
pub const OPERATORS: [&str; 6] = ["$inc", "$set", "$addToSet", "$push", "$pull", "$pullAll"];

/// Operand of `$addToSet`: one value, or several via `{"$each": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddToSetValue {
    Each(EachList),
    Single(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EachList {
    #[serde(rename = "$each")]
    pub each: Vec<Value>,
}

impl AddToSetValue {
    pub fn each(values: Vec<Value>) -> Self {
        AddToSetValue::Each(EachList { each: values })
    }

    pub fn is_each(&self) -> bool {
        matches!(self, AddToSetValue::Each(_))
    }

    /// All values carried by this operand, in order.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            AddToSetValue::Each(list) => list.each.iter().collect(),
            AddToSetValue::Single(v) => vec![v],
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            AddToSetValue::Each(list) => list.each,
            AddToSetValue::Single(v) => vec![v],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateOps {
    #[serde(rename = "$inc", default, skip_serializing_if = "IndexMap::is_empty")]
    pub inc: IndexMap<String, i64>,
    #[serde(rename = "$set", default, skip_serializing_if = "IndexMap::is_empty")]
    pub set: IndexMap<String, Value>,
    #[serde(rename = "$addToSet", default, skip_serializing_if = "IndexMap::is_empty")]
    pub add_to_set: IndexMap<String, AddToSetValue>,
    #[serde(rename = "$push", default, skip_serializing_if = "IndexMap::is_empty")]
    pub push: IndexMap<String, Value>,
    #[serde(rename = "$pull", default, skip_serializing_if = "IndexMap::is_empty")]
    pub pull: IndexMap<String, Value>,
    #[serde(rename = "$pullAll", default, skip_serializing_if = "IndexMap::is_empty")]
    pub pull_all: IndexMap<String, Value>,
}

impl UpdateOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the counter at `path` (summed if the path repeats).
    pub fn inc(&mut self, path: impl Into<String>, delta: i64) -> &mut Self {
        let slot = self.inc.entry(path.into()).or_insert(0);
        *slot = slot.saturating_add(delta);
        self
    }

    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.set.insert(path.into(), value.into());
        self
    }

    pub fn add_to_set(&mut self, path: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let path = path.into();
        let value = AddToSetValue::Single(value.into());
        match self.add_to_set.shift_remove(&path) {
            Some(existing) => {
                let merged = merge::merge_add_to_set(existing, value);
                self.add_to_set.insert(path, merged);
            }
            None => {
                self.add_to_set.insert(path, value);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inc.is_empty()
            && self.set.is_empty()
            && self.add_to_set.is_empty()
            && self.push.is_empty()
            && self.pull.is_empty()
            && self.pull_all.is_empty()
    }

    /// Number of distinct (operator, path) pairs.
    pub fn path_count(&self) -> usize {
        self.inc.len()
            + self.set.len()
            + self.add_to_set.len()
            + self.push.len()
            + self.pull.len()
            + self.pull_all.len()
    }

    /// Parse a raw operator document.
    ///
    /// # Errors
    ///
    /// Returns [`PageMonitorError::InvalidUpdate`] when the document is not an
    /// object, names an operator outside [`OPERATORS`], has a non-object operator
    /// body, or carries a non-integer `$inc` delta.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| PageMonitorError::InvalidUpdate("expected a JSON object".to_string()))?;
        for (op, body) in obj {
            if !OPERATORS.contains(&op.as_str()) {
                return Err(PageMonitorError::InvalidUpdate(format!(
                    "unsupported operator '{}'",
                    op
                )));
            }
            if !body.is_object() {
                return Err(PageMonitorError::InvalidUpdate(format!(
                    "operator '{}' must map paths to values",
                    op
                )));
            }
        }
        serde_json::from_value(doc.clone())
            .map_err(|e| PageMonitorError::InvalidUpdate(e.to_string()))
    }

    pub fn to_json(&self) -> Value {
        // Only maps of JSON values; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
