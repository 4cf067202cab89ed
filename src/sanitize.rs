//! Field-name escaping for user supplied dimension keys.
//!
//! The store addresses nested counters by dotted paths, so `.` `$` and NUL cannot
//! appear inside a path segment. Keys are escaped on write and restored on read.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::analytics::merge::merge_counters;

const DOT_TOKEN: &str = "_dot_";
const DOLLAR_TOKEN: &str = "_dollar_";
const NULL_TOKEN: &str = "_null_";

/// Placeholder for missing or empty keys.
pub const UNKNOWN_KEY: &str = "unknown";
/// Placeholder for a missing fingerprint.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Escape a raw key so it is usable as a single nested field name.
pub fn sanitize_key(raw: &str) -> String {
    if raw.is_empty() {
        return UNKNOWN_KEY.to_string();
    }
    let out = escape(raw);
    if restore_key(&out) != raw {
        tracing::warn!(key = %raw.escape_debug(), "escaped key does not restore to its raw text");
    }
    out
}

fn escape(raw: &str) -> String {
    raw.replace('.', DOT_TOKEN)
        .replace('$', DOLLAR_TOKEN)
        .replace('\0', NULL_TOKEN)
}

/// Same as [`sanitize_key`], treating a missing value as empty.
pub fn sanitize_opt(raw: Option<&str>) -> String {
    sanitize_key(raw.unwrap_or(""))
}

/// Undo [`sanitize_key`] in a single left-to-right pass, so restored text is
/// never scanned again.
pub fn restore_key(safe: &str) -> String {
    if !safe.contains('_') {
        return safe.to_string();
    }
    let mut out = String::with_capacity(safe.len());
    let mut rest = safe;
    while let Some(c) = rest.chars().next() {
        let token = [(DOT_TOKEN, '.'), (DOLLAR_TOKEN, '$'), (NULL_TOKEN, '\0')]
            .into_iter()
            .find(|(token, _)| rest.starts_with(*token));
        match token {
            Some((token, restored)) => {
                out.push(restored);
                rest = &rest[token.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

/// True when `raw` survives [`sanitize_key`] followed by [`restore_key`].
pub fn restores_exactly(raw: &str) -> bool {
    raw.is_empty() || restore_key(&escape(raw)) == raw
}

/// True when `raw` already contains text that [`restore_key`] would rewrite.
pub fn contains_placeholder(raw: &str) -> bool {
    raw.contains(DOT_TOKEN) || raw.contains(DOLLAR_TOKEN) || raw.contains(NULL_TOKEN)
}

/// One-way hash of a client fingerprint. Raw fingerprints never reach the store.
pub fn sanitize_fingerprint(raw: &str) -> String {
    if raw.is_empty() {
        return ANONYMOUS_USER.to_string();
    }
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Restore every object key in `value`, recursively.
///
/// Two escaped keys can restore to the same text (see [`contains_placeholder`]);
/// their values are summed instead of one silently replacing the other.
pub fn restore_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(restore_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(restore_value).collect()),
        other => other.clone(),
    }
}

pub fn restore_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        let restored_key = restore_key(key);
        let restored = restore_value(value);
        match out.get_mut(&restored_key) {
            Some(existing) => {
                tracing::warn!(key = %restored_key, "escaped keys collided on restore, merging");
                let merged = merge_counters(existing, &restored);
                *existing = merged;
            }
            None => {
                out.insert(restored_key, restored);
            }
        }
    }
    out
}
