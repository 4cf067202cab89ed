use serde_json::{Map, Value};

/// Score of a breakdown value: the number itself, or the sum of every numeric
/// leaf under a nested map. Walks with an explicit stack so deep nesting cannot
/// overflow.
pub fn score(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Object(map) => {
            let mut total = 0.0;
            let mut stack: Vec<&Value> = map.values().collect();
            while let Some(item) = stack.pop() {
                match item {
                    Value::Object(inner) => stack.extend(inner.values()),
                    Value::Number(n) => total += n.as_f64().unwrap_or(0.0),
                    _ => {}
                }
            }
            total
        }
        _ => 0.0,
    }
}

/// The `limit` highest-scoring entries of `map`, highest first.
///
/// Ties keep their order in `map`. Keys in `except_keys` are not ranked; if present
/// in `map` they are appended after the ranked entries regardless of `limit`.
pub fn top_entries(map: &Map<String, Value>, limit: usize, except_keys: &[&str]) -> Map<String, Value> {
    let mut scored: Vec<(&String, &Value, f64)> = map
        .iter()
        .filter(|(k, _)| !except_keys.contains(&k.as_str()))
        .map(|(k, v)| (k, v, score(v)))
        .collect();

    // sort_by is stable
    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut out: Map<String, Value> = scored
        .into_iter()
        .take(limit)
        .map(|(k, v, _)| (k.clone(), v.clone()))
        .collect();

    for key in except_keys {
        if let Some(v) = map.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }
    out
}

/// [`top_entries`] on the outer map, then again on each retained inner map.
pub fn top_entries_two_levels(map: &Map<String, Value>, limit: usize) -> Map<String, Value> {
    top_entries(map, limit, &[])
        .into_iter()
        .map(|(k, v)| match v {
            Value::Object(inner) => (k, Value::Object(top_entries(&inner, limit, &[]))),
            other => (k, other),
        })
        .collect()
}
