//! Library-level pipeline scenarios: tracking payloads go through the batch
//! processor into the store and come back out through the report engine.

mod test_failures;
mod test_pipeline;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::batch::BatchProcessor;
use crate::config::{BatchConfig, ReportConfig};
use crate::store::MemoryStore;
use crate::tracking::TrackingRecord;
use crate::ReportEngine;

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub processor: BatchProcessor,
    pub engine: ReportEngine,
}

pub(crate) fn batch_config() -> BatchConfig {
    BatchConfig {
        queue_capacity: 500,
        flush_size: 10,
        flush_interval: Duration::from_millis(20),
        max_retry_attempts: 3,
        retry_base_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(20),
        submit_timeout: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(2),
        slow_flush_threshold: Duration::from_secs(1),
        error_cooldown: Duration::from_millis(5),
    }
}

impl Harness {
    pub fn start(config: BatchConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let processor = BatchProcessor::new(store.clone(), config).unwrap();
        processor.start();
        let engine = ReportEngine::new(
            store.clone(),
            ReportConfig {
                cache_capacity: 0,
                ..Default::default()
            },
        );
        Self {
            store,
            processor,
            engine,
        }
    }

    /// Queue one tracking payload for system `acme` on `day`.
    pub async fn track(&self, day: &str, user: &str, mut payload: Value) -> bool {
        payload["system"] = json!("acme");
        payload["userFingerprint"] = json!(user);
        payload["clientIp"] = json!("203.0.113.9");
        payload["timestamp"] = json!(format!("{}T08:00:00Z", day));
        let record = TrackingRecord::from_json(&payload, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        self.processor.track(&record).await
    }

    pub async fn view(&self, day: &str, user: &str, url: &str) -> bool {
        self.track(day, user, json!({"type": "pageview", "url": url})).await
    }
}

/// Poll `check` every few milliseconds until it holds or `limit` passes.
pub(crate) async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
