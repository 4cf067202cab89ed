//! Combining two update documents into one.
//!
//! `$inc` and `$addToSet` merge commutatively, so coalescing queued deltas for the
//! same shard in any order gives the same stored result. `$set` is last-write-wins.

use serde_json::Value;

use super::{AddToSetValue, UpdateOps};

/// Merge `b` on top of `a`.
pub fn merge(a: &UpdateOps, b: &UpdateOps) -> UpdateOps {
    let mut out = a.clone();
    out.merge_from(b.clone());
    out
}

impl UpdateOps {
    /// Fold `other` into `self` (see [`merge`]).
    pub fn merge_from(&mut self, other: UpdateOps) {
        for (path, delta) in other.inc {
            let slot = self.inc.entry(path).or_insert(0);
            *slot = slot.saturating_add(delta);
        }

        for (path, value) in other.set {
            self.set.insert(path, value);
        }

        for (path, incoming) in other.add_to_set {
            match self.add_to_set.get_mut(&path) {
                Some(existing) => {
                    let current = std::mem::replace(existing, AddToSetValue::each(Vec::new()));
                    *existing = merge_add_to_set(current, incoming);
                }
                None => {
                    self.add_to_set.insert(path, incoming);
                }
            }
        }

        merge_list_operator(&mut self.push, other.push);
        merge_list_operator(&mut self.pull, other.pull);
        merge_list_operator(&mut self.pull_all, other.pull_all);
    }
}

/// Union two `$addToSet` operands, keeping first-seen order and dropping duplicates.
pub(crate) fn merge_add_to_set(existing: AddToSetValue, incoming: AddToSetValue) -> AddToSetValue {
    let keep_each = existing.is_each() || incoming.is_each();
    let mut values = existing.into_values();
    for value in incoming.into_values() {
        if !values.contains(&value) {
            values.push(value);
        }
    }
    if !keep_each && values.len() == 1 {
        AddToSetValue::Single(values.remove(0))
    } else {
        AddToSetValue::each(values)
    }
}

fn merge_list_operator(target: &mut indexmap::IndexMap<String, Value>, other: indexmap::IndexMap<String, Value>) {
    for (path, incoming) in other {
        match target.shift_remove(&path) {
            Some(existing) => {
                target.insert(path, merge_list_operand(existing, incoming));
            }
            None => {
                target.insert(path, incoming);
            }
        }
    }
}

/// Concatenate list operands; any shape we do not recognise is overwritten.
fn merge_list_operand(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Array(mut current), Value::Array(extra)) => {
            current.extend(extra);
            Value::Array(current)
        }
        (Value::Object(mut current), Value::Object(extra)) => {
            for modifier in ["$each", "$in"] {
                let both_lists = matches!(current.get(modifier), Some(Value::Array(_)))
                    && matches!(extra.get(modifier), Some(Value::Array(_)));
                if both_lists {
                    if let (Some(Value::Array(list)), Some(Value::Array(more))) =
                        (current.get_mut(modifier), extra.get(modifier))
                    {
                        list.extend(more.iter().cloned());
                    }
                    return Value::Object(current);
                }
            }
            Value::Object(extra)
        }
        (_, incoming) => incoming,
    }
}
