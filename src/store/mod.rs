//! Document store seam for stat shards.
//!
//! The batch processor writes through [`StatStore::bulk_write`] and the report
//! engine reads through [`StatStore::find`]. [`MemoryStore`] is the in-process
//! implementation used by the server binary and the test suites.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{ShardKey, StatType};
use crate::update::UpdateOps;

pub use memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// One upsert in a bulk write: apply `update` to the shard at `key`,
/// creating it when missing.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteModel {
    pub key: ShardKey,
    pub update: UpdateOps,
}

impl WriteModel {
    pub fn upsert(key: ShardKey, update: UpdateOps) -> Self {
        Self { key, update }
    }
}

/// A single failed operation inside a bulk write, by position in the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    pub index: usize,
    pub message: String,
}

/// Outcome of an unordered bulk write. Failures of individual operations do
/// not stop the remaining ones; they are listed in `write_errors`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub upserted: u64,
    pub write_errors: Vec<WriteError>,
}

impl BulkWriteResult {
    pub fn is_complete(&self) -> bool {
        self.write_errors.is_empty()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = self.write_errors.iter().map(|e| e.index).collect();
        idx.sort_unstable();
        idx.dedup();
        idx
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub matched: bool,
    pub upserted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    DateAscending,
    DateDescending,
}

/// Range query over one system's shards of one type. Both date bounds are
/// inclusive and optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardQuery {
    pub system: String,
    pub stat_type: StatType,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ShardQuery {
    pub fn new(system: impl Into<String>, stat_type: StatType) -> Self {
        Self {
            system: system.into(),
            stat_type,
            start_date: None,
            end_date: None,
        }
    }

    pub fn with_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Whether a shard document falls inside this query. Dates compare as
    /// strings, which orders correctly for `YYYY-MM-DD`.
    pub fn matches(&self, doc: &Value) -> bool {
        if doc.get("system").and_then(Value::as_str) != Some(self.system.as_str()) {
            return false;
        }
        if doc.get("type").and_then(Value::as_str) != Some(self.stat_type.as_str()) {
            return false;
        }
        let Some(date) = doc.get("date").and_then(Value::as_str) else {
            return false;
        };
        if let Some(start) = &self.start_date {
            if date < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &self.end_date {
            if date > end.as_str() {
                return false;
            }
        }
        true
    }

    /// The query as a filter document, for stores that speak operator JSON.
    pub fn to_filter(&self) -> Value {
        let mut filter = serde_json::json!({
            "system": self.system,
            "type": self.stat_type.as_str(),
        });
        let mut range = serde_json::Map::new();
        if let Some(start) = &self.start_date {
            range.insert("$gte".to_string(), Value::from(start.as_str()));
        }
        if let Some(end) = &self.end_date {
            range.insert("$lte".to_string(), Value::from(end.as_str()));
        }
        if !range.is_empty() {
            filter["date"] = Value::Object(range);
        }
        filter
    }
}

#[async_trait]
pub trait StatStore: Send + Sync {
    /// Apply `update` to the shard at `key`, creating it if it does not exist.
    async fn upsert(&self, key: &ShardKey, update: &UpdateOps) -> Result<WriteSummary, StoreError>;

    /// Unordered bulk upsert. `Err` means the whole call failed and nothing
    /// can be assumed applied; per-operation failures are reported in the
    /// result instead.
    async fn bulk_write(&self, ops: &[WriteModel]) -> Result<BulkWriteResult, StoreError>;

    /// Matching shard documents sorted by date, each reduced to `projection`
    /// (all fields when empty).
    async fn find(
        &self,
        query: &ShardQuery,
        projection: &[&str],
        sort: SortOrder,
    ) -> Result<Vec<Value>, StoreError>;

    /// Remove every shard of `system`. Returns the number removed.
    async fn delete_system(&self, system: &str) -> Result<u64, StoreError>;
}
