use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use super::{
    BulkWriteResult, ShardQuery, SortOrder, StatStore, StoreError, WriteError, WriteModel,
    WriteSummary,
};
use crate::types::ShardKey;
use crate::update::{AddToSetValue, UpdateOps};

/// In-process shard store.
///
/// Applies operator documents to JSON shards the way a document database would
/// (dotted paths, `$inc` creates missing counters, `$addToSet` keeps arrays
/// duplicate-free). A failing operation leaves its shard untouched.
#[derive(Default)]
pub struct MemoryStore {
    shards: DashMap<ShardKey, Value>,
    /// Remaining forced failures per key.
    failures: DashMap<ShardKey, u32>,
    attempts: DashMap<ShardKey, u64>,
    unavailable: AtomicBool,
    find_delay_ms: AtomicU64,
    bulk_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` writes touching `key` fail. `u32::MAX` fails forever.
    pub fn fail_key(&self, key: &ShardKey, times: u32) {
        if times == 0 {
            self.failures.remove(key);
        } else {
            self.failures.insert(key.clone(), times);
        }
    }

    /// While set, every call returns [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Delay applied to each `find` call.
    pub fn set_find_delay(&self, delay: Duration) {
        self.find_delay_ms
            .store(delay.as_millis() as u64, Ordering::Release);
    }

    /// Number of write attempts (successful or not) that targeted `key`.
    pub fn write_attempts(&self, key: &ShardKey) -> u64 {
        self.attempts.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::Acquire)
    }

    pub fn get(&self, key: &ShardKey) -> Option<Value> {
        self.shards.get(key).map(|doc| doc.clone())
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn take_forced_failure(&self, key: &ShardKey) -> bool {
        let mut exhausted = false;
        let hit = match self.failures.get_mut(key) {
            Some(mut remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                exhausted = *remaining == 0;
                true
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(key);
        }
        hit
    }

    fn apply_one(&self, key: &ShardKey, update: &UpdateOps) -> Result<WriteSummary, StoreError> {
        *self.attempts.entry(key.clone()).or_insert(0) += 1;

        if !key.is_complete() {
            return Err(StoreError::WriteRejected(format!("incomplete key {}", key)));
        }
        if update.is_empty() {
            return Err(StoreError::WriteRejected("empty update document".to_string()));
        }
        if self.take_forced_failure(key) {
            return Err(StoreError::WriteRejected(format!("injected failure for {}", key)));
        }

        let mut entry = self.shards.entry(key.clone()).or_insert(Value::Null);
        let upserted = entry.is_null();
        let mut doc = if upserted {
            key.to_filter()
        } else {
            entry.value().clone()
        };

        match apply_update(&mut doc, update) {
            Ok(()) => {
                *entry = doc;
                Ok(WriteSummary {
                    matched: !upserted,
                    upserted,
                })
            }
            Err(e) => {
                drop(entry);
                if upserted {
                    self.shards.remove_if(key, |_, v| v.is_null());
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StatStore for MemoryStore {
    async fn upsert(&self, key: &ShardKey, update: &UpdateOps) -> Result<WriteSummary, StoreError> {
        self.check_available()?;
        self.apply_one(key, update)
    }

    async fn bulk_write(&self, ops: &[WriteModel]) -> Result<BulkWriteResult, StoreError> {
        self.bulk_calls.fetch_add(1, Ordering::AcqRel);
        self.check_available()?;

        let mut result = BulkWriteResult::default();
        for (index, op) in ops.iter().enumerate() {
            match self.apply_one(&op.key, &op.update) {
                Ok(summary) => {
                    if summary.upserted {
                        result.upserted += 1;
                    } else {
                        result.matched += 1;
                    }
                }
                Err(e) => result.write_errors.push(WriteError {
                    index,
                    message: e.to_string(),
                }),
            }
        }
        tracing::trace!(
            "[STORE] bulk ops={} matched={} upserted={} errors={}",
            ops.len(),
            result.matched,
            result.upserted,
            result.write_errors.len()
        );
        Ok(result)
    }

    async fn find(
        &self,
        query: &ShardQuery,
        projection: &[&str],
        sort: SortOrder,
    ) -> Result<Vec<Value>, StoreError> {
        self.check_available()?;
        let delay = self.find_delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut docs: Vec<Value> = self
            .shards
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        docs.sort_by(|a, b| {
            let da = a.get("date").and_then(Value::as_str).unwrap_or("");
            let db = b.get("date").and_then(Value::as_str).unwrap_or("");
            match sort {
                SortOrder::DateAscending => da.cmp(db),
                SortOrder::DateDescending => db.cmp(da),
            }
        });

        if projection.is_empty() {
            return Ok(docs);
        }
        Ok(docs
            .into_iter()
            .map(|doc| {
                let projected: Map<String, Value> = projection
                    .iter()
                    .filter_map(|field| doc.get(*field).map(|v| (field.to_string(), v.clone())))
                    .collect();
                Value::Object(projected)
            })
            .collect())
    }

    async fn delete_system(&self, system: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let before = self.shards.len();
        self.shards.retain(|key, _| key.system != system);
        Ok(before.saturating_sub(self.shards.len()) as u64)
    }
}

/// Apply every operator of `update` to `doc`.
pub fn apply_update(doc: &mut Value, update: &UpdateOps) -> Result<(), StoreError> {
    for (path, value) in &update.set {
        *slot(doc, path)? = value.clone();
    }
    for (path, delta) in &update.inc {
        let target = slot(doc, path)?;
        *target = match &*target {
            Value::Null => Value::from(*delta),
            Value::Number(n) => match n.as_i64() {
                Some(current) => Value::from(current.saturating_add(*delta)),
                None => Value::from(n.as_f64().unwrap_or(0.0) + *delta as f64),
            },
            _ => {
                return Err(StoreError::WriteRejected(format!(
                    "cannot apply $inc to non-numeric field '{}'",
                    path
                )))
            }
        };
    }
    for (path, operand) in &update.add_to_set {
        let list = array_slot(doc, path, "$addToSet")?;
        for value in add_to_set_values(operand) {
            if !list.contains(value) {
                list.push(value.clone());
            }
        }
    }
    for (path, operand) in &update.push {
        let list = array_slot(doc, path, "$push")?;
        match operand {
            Value::Object(obj) if obj.contains_key("$each") => {
                if let Some(Value::Array(items)) = obj.get("$each") {
                    list.extend(items.iter().cloned());
                }
            }
            Value::Array(items) => list.extend(items.iter().cloned()),
            other => list.push(other.clone()),
        }
    }
    for (path, operand) in &update.pull {
        if let Some(list) = existing_array(doc, path, "$pull")? {
            match operand {
                Value::Object(obj) if obj.contains_key("$in") => {
                    if let Some(Value::Array(items)) = obj.get("$in") {
                        list.retain(|v| !items.contains(v));
                    }
                }
                other => list.retain(|v| v != other),
            }
        }
    }
    for (path, operand) in &update.pull_all {
        let Value::Array(items) = operand else {
            return Err(StoreError::WriteRejected(format!(
                "$pullAll requires an array for '{}'",
                path
            )));
        };
        if let Some(list) = existing_array(doc, path, "$pullAll")? {
            list.retain(|v| !items.contains(v));
        }
    }
    Ok(())
}

fn add_to_set_values(operand: &AddToSetValue) -> Vec<&Value> {
    operand.values()
}

/// Walk a dotted path, creating intermediate objects, and return the leaf slot
/// (`Null` when newly created).
fn slot<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Value, StoreError> {
    let mut current = doc;
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(StoreError::WriteRejected(format!("empty segment in path '{}'", path)));
        }
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(StoreError::WriteRejected(format!(
                "cannot traverse non-object at '{}' in path '{}'",
                segment, path
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(current)
}

fn array_slot<'a>(doc: &'a mut Value, path: &str, op: &str) -> Result<&'a mut Vec<Value>, StoreError> {
    let target = slot(doc, path)?;
    if target.is_null() {
        *target = Value::Array(Vec::new());
    }
    match target {
        Value::Array(list) => Ok(list),
        _ => Err(StoreError::WriteRejected(format!(
            "cannot apply {} to non-array field '{}'",
            op, path
        ))),
    }
}

fn existing_array<'a>(
    doc: &'a mut Value,
    path: &str,
    op: &str,
) -> Result<Option<&'a mut Vec<Value>>, StoreError> {
    let mut current = doc;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    match current {
        Value::Array(list) => Ok(Some(list)),
        Value::Null => Ok(None),
        _ => Err(StoreError::WriteRejected(format!(
            "cannot apply {} to non-array field '{}'",
            op, path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatType;
    use serde_json::json;

    fn key(date: &str) -> ShardKey {
        ShardKey::new("acme", date, StatType::PageViews)
    }

    fn ops(doc: Value) -> UpdateOps {
        UpdateOps::from_json(&doc).unwrap()
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = MemoryStore::new();
        let k = key("2024-01-01");
        let u = ops(json!({"$inc": {"data.total": 1, "data.byUrl./home": 1}}));

        let first = store.upsert(&k, &u).await.unwrap();
        assert!(first.upserted);
        let second = store.upsert(&k, &u).await.unwrap();
        assert!(second.matched);

        let doc = store.get(&k).unwrap();
        assert_eq!(doc["system"], "acme");
        assert_eq!(doc["type"], "pageViews");
        assert_eq!(doc["data"]["total"], 2);
        assert_eq!(doc["data"]["byUrl"]["/home"], 2);
    }

    #[test]
    fn add_to_set_is_duplicate_free() {
        let mut doc = json!({});
        apply_update(&mut doc, &ops(json!({"$addToSet": {"data.u": "a"}}))).unwrap();
        apply_update(&mut doc, &ops(json!({"$addToSet": {"data.u": {"$each": ["a", "b"]}}}))).unwrap();
        assert_eq!(doc["data"]["u"], json!(["a", "b"]));
    }

    #[test]
    fn push_pull_and_pull_all() {
        let mut doc = json!({});
        apply_update(&mut doc, &ops(json!({"$push": {"l": {"$each": [1, 2, 3, 4]}}}))).unwrap();
        apply_update(&mut doc, &ops(json!({"$push": {"l": 5}}))).unwrap();
        apply_update(&mut doc, &ops(json!({"$pull": {"l": {"$in": [1, 2]}}}))).unwrap();
        apply_update(&mut doc, &ops(json!({"$pullAll": {"l": [5]}}))).unwrap();
        assert_eq!(doc["l"], json!([3, 4]));
    }

    #[test]
    fn inc_on_non_numeric_is_rejected_without_partial_apply() {
        let store = MemoryStore::new();
        let k = key("2024-01-01");
        store.apply_one(&k, &ops(json!({"$set": {"data.total": "x"}}))).unwrap();
        let err = store
            .apply_one(&k, &ops(json!({"$inc": {"data.total": 1, "data.other": 1}})))
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected(_)));
        assert!(store.get(&k).unwrap()["data"].get("other").is_none());
    }

    #[tokio::test]
    async fn bulk_write_is_unordered() {
        let store = MemoryStore::new();
        let bad = key("2024-01-02");
        store.fail_key(&bad, 1);
        let u = ops(json!({"$inc": {"data.total": 1}}));
        let result = store
            .bulk_write(&[
                WriteModel::upsert(key("2024-01-01"), u.clone()),
                WriteModel::upsert(bad.clone(), u.clone()),
                WriteModel::upsert(key("2024-01-03"), u.clone()),
            ])
            .await
            .unwrap();
        assert_eq!(result.upserted, 2);
        assert_eq!(result.failed_indices(), vec![1]);
        assert!(store.get(&bad).is_none());
        assert_eq!(store.write_attempts(&bad), 1);

        // the injected failure was used up
        let retry = store.bulk_write(&[WriteModel::upsert(bad.clone(), u)]).await.unwrap();
        assert!(retry.is_complete());
    }

    #[tokio::test]
    async fn unavailable_store_fails_whole_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .bulk_write(&[WriteModel::upsert(key("2024-01-01"), ops(json!({"$inc": {"a": 1}})))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn find_sorts_and_projects() {
        let store = MemoryStore::new();
        let u = ops(json!({"$inc": {"data.total": 1}}));
        for date in ["2024-01-03", "2024-01-01", "2024-01-02"] {
            store.upsert(&key(date), &u).await.unwrap();
        }
        store
            .upsert(&ShardKey::new("other", "2024-01-01", StatType::PageViews), &u)
            .await
            .unwrap();

        let q = ShardQuery::new("acme", StatType::PageViews);
        let docs = store.find(&q, &["date", "data"], SortOrder::DateAscending).await.unwrap();
        let dates: Vec<&str> = docs.iter().map(|d| d["date"].as_str().unwrap()).collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert!(docs[0].get("system").is_none());

        let desc = store.find(&q, &[], SortOrder::DateDescending).await.unwrap();
        assert_eq!(desc[0]["date"], "2024-01-03");
        assert_eq!(desc[0]["system"], "acme");
    }

    #[tokio::test]
    async fn delete_system_removes_only_that_system() {
        let store = MemoryStore::new();
        let u = ops(json!({"$inc": {"data.total": 1}}));
        store.upsert(&key("2024-01-01"), &u).await.unwrap();
        store.upsert(&key("2024-01-02"), &u).await.unwrap();
        store
            .upsert(&ShardKey::new("other", "2024-01-01", StatType::Events), &u)
            .await
            .unwrap();
        assert_eq!(store.delete_system("acme").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn incomplete_key_and_empty_update_are_rejected() {
        let store = MemoryStore::new();
        let u = ops(json!({"$inc": {"a": 1}}));
        assert!(store.apply_one(&ShardKey::new("", "2024-01-01", StatType::Events), &u).is_err());
        assert!(store.apply_one(&key("2024-01-01"), &UpdateOps::new()).is_err());
        assert!(store.is_empty());
    }
}
