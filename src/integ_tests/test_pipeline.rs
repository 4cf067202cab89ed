use serde_json::{json, Value};

use super::{batch_config, Harness};
use crate::types::{ShardKey, StatType};

#[tokio::test]
async fn page_views_roll_up_after_drain() {
    let h = Harness::start(batch_config());
    assert!(h.view("2024-01-01", "u1", "/home").await);
    assert!(h.view("2024-01-01", "u2", "/home").await);
    assert!(h.view("2024-01-01", "u1", "/about").await);
    h.processor.stop().await;

    let report = h
        .engine
        .query_aggregate("acme", Some("2024-01-01"), Some("2024-01-01"), StatType::PageViews, 10)
        .await
        .unwrap();
    let pv = report.as_page_views().unwrap();
    assert_eq!(pv.total_views, 3);
    assert_eq!(Value::Object(pv.urls.clone()), json!({"/home": 2, "/about": 1}));
    assert_eq!(pv.unique_users, 2);
}

#[tokio::test]
async fn same_user_counts_once() {
    let h = Harness::start(batch_config());
    h.view("2024-01-01", "u1", "/home").await;
    h.view("2024-01-01", "u1", "/home").await;
    h.view("2024-01-02", "u1", "/home").await;
    h.processor.stop().await;

    let report = h
        .engine
        .query_aggregate("acme", None, None, StatType::PageViews, 10)
        .await
        .unwrap();
    let pv = report.as_page_views().unwrap();
    assert_eq!(pv.total_views, 3);
    assert_eq!(pv.unique_users, 1);
    assert_eq!(pv.url_unique_users["/home"], 1);
    assert_eq!(pv.trend_data.len(), 2);
    assert_eq!(pv.trend_data[0].unique_users, Some(1));
}

#[tokio::test]
async fn coalesced_writes_land_in_one_shard() {
    let h = Harness::start(batch_config());
    for _ in 0..25 {
        h.view("2024-01-01", "u1", "/home").await;
    }
    h.processor.stop().await;

    let key = ShardKey::new("acme", "2024-01-01", StatType::PageViews);
    let shard = h.store.get(&key).unwrap();
    assert_eq!(shard["data"]["total"], 25);
    assert_eq!(shard["data"]["uniqueUsers"].as_array().unwrap().len(), 1);
    // coalescing means fewer writes than events
    assert!(h.store.write_attempts(&key) < 25);
    assert_eq!(h.processor.metrics().total_processed, 25);
}

#[tokio::test]
async fn event_kinds_use_separate_shards() {
    let h = Harness::start(batch_config());
    h.view("2024-01-01", "u1", "/home").await;
    h.track("2024-01-01", "u1", json!({"type": "download", "fileName": "a.zip"})).await;
    h.track("2024-01-01", "u1", json!({"type": "event", "eventCategory": "nav"})).await;
    h.track("2024-01-01", "u1", json!({"type": "duration", "url": "/home", "duration": 12})).await;
    h.processor.stop().await;

    assert_eq!(h.store.len(), 4);
    for stat_type in StatType::ALL {
        let report = h
            .engine
            .query_aggregate("acme", None, None, stat_type, 10)
            .await
            .unwrap();
        assert_eq!(report.stat_type(), stat_type);
        assert_eq!(report.unique_users(), 1);
    }
    let duration = h
        .engine
        .query_aggregate("acme", None, None, StatType::Duration, 10)
        .await
        .unwrap();
    assert_eq!(duration.total(), 12);
}

#[tokio::test]
async fn special_characters_round_trip() {
    let h = Harness::start(batch_config());
    h.view("2024-01-01", "u1", "http://a.b/x$y").await;
    h.processor.stop().await;

    let report = h
        .engine
        .query_aggregate("acme", None, None, StatType::PageViews, 10)
        .await
        .unwrap();
    let pv = report.as_page_views().unwrap();
    assert_eq!(pv.urls["http://a.b/x$y"], 1);
    assert_eq!(pv.trend_data[0].breakdown["byUrl"]["http://a.b/x$y"]["count"], 1);
}

#[tokio::test]
async fn concurrent_producers_are_all_counted() {
    let h = Harness::start(batch_config());
    let mut tasks = Vec::new();
    for producer in 0..4 {
        let processor = h.processor.clone();
        tasks.push(tokio::spawn(async move {
            let mut accepted = 0;
            for i in 0..50 {
                let payload = json!({
                    "type": "pageview",
                    "system": "acme",
                    "userFingerprint": format!("p{}-{}", producer, i % 5),
                    "timestamp": "2024-01-01T00:00:00Z",
                    "url": format!("/page/{}", i % 3),
                });
                let record = crate::tracking::TrackingRecord::from_json(&payload, chrono::Utc::now()).unwrap();
                if processor.track(&record).await {
                    accepted += 1;
                }
            }
            accepted
        }));
    }
    let mut accepted = 0;
    for task in tasks {
        accepted += task.await.unwrap();
    }
    assert_eq!(accepted, 200);
    h.processor.stop().await;

    let report = h
        .engine
        .query_aggregate("acme", None, None, StatType::PageViews, 10)
        .await
        .unwrap();
    assert_eq!(report.total(), 200);
    assert_eq!(report.unique_users(), 20);
}
