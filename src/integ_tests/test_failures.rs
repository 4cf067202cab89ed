use std::time::Duration;

use super::{batch_config, wait_until, Harness};
use crate::batch::ProcessorState;
use crate::config::BatchConfig;
use crate::types::{ShardKey, StatType};
use crate::StatStore;

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let h = Harness::start(batch_config());
    let key = ShardKey::new("acme", "2024-01-01", StatType::PageViews);
    h.store.fail_key(&key, 2);

    h.view("2024-01-01", "u1", "/home").await;
    let store = h.store.clone();
    let written = key.clone();
    assert!(wait_until(Duration::from_secs(2), || store.get(&written).is_some()).await);
    h.processor.stop().await;

    assert_eq!(h.store.get(&key).unwrap()["data"]["total"], 1);
    assert_eq!(h.store.write_attempts(&key), 3);
    let m = h.processor.metrics();
    assert_eq!(m.dropped_after_max_retries, 0);
    assert_eq!(m.total_errors, 2);
}

#[tokio::test]
async fn poisoned_shard_dropped_once_others_written() {
    let h = Harness::start(batch_config());
    let bad = ShardKey::new("acme", "2024-01-01", StatType::PageViews);
    h.store.fail_key(&bad, u32::MAX);

    h.view("2024-01-01", "u1", "/home").await;
    h.view("2024-01-02", "u1", "/home").await;

    let processor = h.processor.clone();
    assert!(
        wait_until(Duration::from_secs(2), || processor.metrics().dropped_after_max_retries == 1).await
    );
    h.processor.stop().await;

    let m = h.processor.metrics();
    assert_eq!(m.dropped_after_max_retries, 1);
    assert_eq!(m.retries_in_flight, 0);
    assert_eq!(h.store.write_attempts(&bad), 4);
    assert!(h.store.get(&bad).is_none());
    let good = ShardKey::new("acme", "2024-01-02", StatType::PageViews);
    assert_eq!(h.store.get(&good).unwrap()["data"]["total"], 1);
}

#[tokio::test]
async fn stopped_processor_rejects() {
    let h = Harness::start(batch_config());
    h.processor.stop().await;
    assert_eq!(h.processor.state(), ProcessorState::Stopped);
    assert!(!h.view("2024-01-01", "u1", "/home").await);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn outage_then_recovery() {
    let h = Harness::start(BatchConfig {
        max_retry_attempts: 10,
        ..batch_config()
    });
    h.store.set_unavailable(true);
    h.view("2024-01-01", "u1", "/home").await;

    let processor = h.processor.clone();
    assert!(wait_until(Duration::from_secs(1), || processor.metrics().total_errors >= 1).await);
    h.store.set_unavailable(false);

    let store = h.store.clone();
    let key = ShardKey::new("acme", "2024-01-01", StatType::PageViews);
    let written = key.clone();
    assert!(wait_until(Duration::from_secs(2), || store.get(&written).is_some()).await);
    h.processor.stop().await;
    assert_eq!(h.store.get(&key).unwrap()["data"]["total"], 1);
}

#[tokio::test]
async fn purge_removes_system_shards() {
    let h = Harness::start(batch_config());
    h.view("2024-01-01", "u1", "/home").await;
    h.track("2024-01-01", "u1", serde_json::json!({"type": "download"})).await;
    h.processor.stop().await;
    assert_eq!(h.store.len(), 2);

    assert_eq!(h.engine.purge_system("acme").await.unwrap(), 2);
    assert!(h.store.is_empty());
    assert_eq!(h.store.delete_system("acme").await.unwrap(), 0);
}
