//! Read side: scan a system's shards over a date range and fold them into one
//! report per statistics type.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};

use super::cache::{CacheKey, ReportCache};
use super::merge::{as_count, distinct_count, merge_counter_maps, merge_counters, UserSets};
use super::report::{
    Breakdown, DownloadReport, DurationReport, EventReport, PageViewReport, Report, TrendPoint,
};
use super::top_n::{top_entries, top_entries_two_levels};
use crate::config::ReportConfig;
use crate::error::{PageMonitorError, Result};
use crate::sanitize::{restore_map, sanitize_key};
use crate::store::{ShardQuery, SortOrder, StatStore};
use crate::types::{validate_date, StatType};

pub const DEFAULT_LIMIT: usize = 10;

const PROJECTION: [&str; 2] = ["date", "data"];

/// Duration breakdowns store their session counts under this key.
const COUNT_KEY: &str = "count";

pub struct ReportEngine {
    store: Arc<dyn StatStore>,
    config: ReportConfig,
    cache: ReportCache,
}

impl ReportEngine {
    pub fn new(store: Arc<dyn StatStore>, config: ReportConfig) -> Self {
        let cache = ReportCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            store,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    /// Report for `system` over `[start, end]` (both inclusive, both optional).
    ///
    /// Identical calls within the cache TTL share one `Arc<Report>`.
    pub async fn query_aggregate(
        &self,
        system: &str,
        start: Option<&str>,
        end: Option<&str>,
        stat_type: StatType,
        limit: usize,
    ) -> Result<Arc<Report>> {
        let key = cache_key(system, start, end, stat_type, limit)?;
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(system = %key.system, stat_type = %stat_type, "report cache hit");
            return Ok(hit);
        }
        let report = Arc::new(self.aggregate(&key).await?);
        self.cache.insert(key, Arc::clone(&report));
        Ok(report)
    }

    /// Same as [`query_aggregate`](Self::query_aggregate) without touching the cache.
    pub async fn query_aggregate_uncached(
        &self,
        system: &str,
        start: Option<&str>,
        end: Option<&str>,
        stat_type: StatType,
        limit: usize,
    ) -> Result<Report> {
        let key = cache_key(system, start, end, stat_type, limit)?;
        self.aggregate(&key).await
    }

    /// Delete every shard of `system` and forget its cached reports.
    pub async fn purge_system(&self, system: &str) -> Result<u64> {
        let system = sanitize_key(system);
        let deleted = self.store.delete_system(&system).await.map_err(|e| {
            tracing::error!(system = %system, error = %e, "failed to delete system statistics");
            PageMonitorError::from(e)
        })?;
        let dropped = self.cache.invalidate_system(&system);
        tracing::info!(system = %system, deleted, cached_reports = dropped, "purged system statistics");
        Ok(deleted)
    }

    async fn aggregate(&self, key: &CacheKey) -> Result<Report> {
        let query = ShardQuery::new(key.system.as_str(), key.stat_type)
            .with_range(key.start.clone(), key.end.clone());
        let started = Instant::now();

        let scan = self.store.find(&query, &PROJECTION, SortOrder::DateAscending);
        let docs = tokio::time::timeout(self.config.scan_timeout, scan)
            .await
            .map_err(|_| {
                tracing::warn!(
                    system = %key.system,
                    stat_type = %key.stat_type,
                    "shard scan exceeded {:?}",
                    self.config.scan_timeout
                );
                PageMonitorError::ScanTimeout(self.config.scan_timeout)
            })?
            .map_err(|e| {
                tracing::error!(system = %key.system, stat_type = %key.stat_type, error = %e, "shard scan failed");
                PageMonitorError::from(e)
            })?;

        let mut acc = Accumulator::default();
        for doc in &docs {
            let Some(data) = doc.get("data").and_then(Value::as_object) else {
                continue;
            };
            let date = doc
                .get("date")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            acc.trend
                .push(trend_point(key.stat_type, date, data, key.limit));
            acc.absorb(data);
        }

        tracing::debug!(
            system = %key.system,
            stat_type = %key.stat_type,
            shards = docs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregated report"
        );
        Ok(acc.finish(key.stat_type, key.limit))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn cache_key(
    system: &str,
    start: Option<&str>,
    end: Option<&str>,
    stat_type: StatType,
    limit: usize,
) -> Result<CacheKey> {
    let start = non_empty(start);
    let end = non_empty(end);
    if let Some(s) = start {
        validate_date(s)?;
    }
    if let Some(e) = end {
        validate_date(e)?;
    }
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(PageMonitorError::InvalidDateRange {
                start: s.to_string(),
                end: e.to_string(),
            });
        }
    }
    Ok(CacheKey {
        system: sanitize_key(system),
        start: start.map(str::to_string),
        end: end.map(str::to_string),
        stat_type,
        limit,
    })
}

fn is_user_set_field(field: &str) -> bool {
    field == "uniqueUsers" || field.ends_with("UniqueUsers")
}

/// `{key: {count, uniqueUsers}}` for the top `limit` keys of `counts`.
fn counted_breakdown(counts: &Map<String, Value>, users: Option<&Value>, limit: usize) -> Breakdown {
    top_entries(counts, limit, &[])
        .into_iter()
        .map(|(k, count)| {
            let unique = distinct_count(users.and_then(|u| u.get(&k)));
            (k, json!({"count": count, "uniqueUsers": unique}))
        })
        .collect()
}

/// Trend entry for one shard, with its per-day top breakdown.
fn trend_point(stat_type: StatType, date: String, data: &Map<String, Value>, limit: usize) -> TrendPoint {
    let mut point = TrendPoint {
        date,
        total: as_count(data.get("total")),
        ..Default::default()
    };

    let by = |name: &str| data.get(name).and_then(Value::as_object);
    let breakdown = match stat_type {
        StatType::PageViews => by("byUrl").map(|urls| {
            ("byUrl", counted_breakdown(urls, data.get("byUrlUniqueUsers"), limit))
        }),
        StatType::Downloads => by("byFile").map(|files| {
            ("byFile", counted_breakdown(files, data.get("byFileUniqueUsers"), limit))
        }),
        StatType::Events => by("byCategoryAndAction").map(|categories| {
            let per_user = data.get("byCategoryAndActionAndUser");
            let mut counts = Map::new();
            let mut users = Map::new();
            for (category, actions) in categories {
                let Some(actions) = actions.as_object() else {
                    continue;
                };
                for (action, count) in actions {
                    let event_key = format!("{}.{}", category, action);
                    let distinct = per_user
                        .and_then(|u| u.get(category))
                        .and_then(|u| u.get(action))
                        .and_then(Value::as_object)
                        .map(|m| m.len())
                        .unwrap_or(0);
                    users.insert(event_key.clone(), Value::from(distinct as u64));
                    counts.insert(event_key, count.clone());
                }
            }
            let top: Breakdown = top_entries(&counts, limit, &[])
                .into_iter()
                .map(|(k, count)| {
                    let unique = users.get(&k).cloned().unwrap_or(Value::from(0));
                    (k, json!({"count": count, "uniqueUsers": unique}))
                })
                .collect();
            ("byCategoryAndAction", top)
        }),
        StatType::Duration => by("byUrl").map(|urls| {
            let sessions = urls.get(COUNT_KEY);
            let top: Breakdown = top_entries(urls, limit, &[COUNT_KEY])
                .into_iter()
                .filter(|(k, _)| k != COUNT_KEY)
                .map(|(k, total)| {
                    let count = as_count(sessions.and_then(|s| s.get(&k)));
                    (k, json!({"total": total, "count": count}))
                })
                .collect();
            ("byUrl", top)
        }),
    };

    match stat_type {
        StatType::Duration => point.count = Some(as_count(data.get(COUNT_KEY))),
        _ => point.unique_users = Some(distinct_count(data.get("uniqueUsers"))),
    }
    if let Some((name, top)) = breakdown {
        point.breakdown.insert(name.to_string(), Value::Object(restore_map(&top)));
    }
    point
}

/// Request-scoped fold of every scanned shard.
#[derive(Default)]
struct Accumulator {
    total: i64,
    sessions: i64,
    counters: Map<String, Value>,
    users: BTreeMap<String, UserSets>,
    trend: Vec<TrendPoint>,
}

impl Accumulator {
    fn absorb(&mut self, data: &Map<String, Value>) {
        for (field, value) in data {
            match field.as_str() {
                "total" => self.total = self.total.saturating_add(as_count(Some(value))),
                COUNT_KEY => self.sessions = self.sessions.saturating_add(as_count(Some(value))),
                f if is_user_set_field(f) => {
                    self.users.entry(field.clone()).or_default().absorb(value);
                }
                _ => match (self.counters.get_mut(field), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        merge_counter_maps(existing, incoming);
                    }
                    (Some(existing), _) => {
                        let merged = merge_counters(existing, value);
                        *existing = merged;
                    }
                    (None, _) => {
                        self.counters.insert(field.clone(), value.clone());
                    }
                },
            }
        }
    }

    /// Restored counter map for one dimension.
    fn dimension(&self, name: &str) -> Map<String, Value> {
        self.counters
            .get(name)
            .and_then(Value::as_object)
            .map(restore_map)
            .unwrap_or_default()
    }

    fn top(&self, name: &str, limit: usize) -> Breakdown {
        top_entries(&self.dimension(name), limit, &[])
    }

    /// Top entries of a duration dimension, with its `count` companion cut
    /// down to the keys that survived.
    fn top_duration(&self, name: &str, limit: usize) -> Breakdown {
        let mut top = top_entries(&self.dimension(name), limit, &[COUNT_KEY]);
        let retained: HashSet<String> = top.keys().filter(|k| *k != COUNT_KEY).cloned().collect();
        if let Some(Value::Object(counts)) = top.get_mut(COUNT_KEY) {
            counts.retain(|k, _| retained.contains(k));
        }
        top
    }

    /// Cardinalities of a unique-user dimension, restored.
    fn user_counts(&self, name: &str) -> Map<String, Value> {
        self.users
            .get(name)
            .map(|sets| restore_map(&sets.counts_map()))
            .unwrap_or_default()
    }

    fn top_users(&self, name: &str, limit: usize) -> Breakdown {
        top_entries(&self.user_counts(name), limit, &[])
    }

    fn unique_users(&self) -> u64 {
        self.users.get("uniqueUsers").map(UserSets::len).unwrap_or(0) as u64
    }

    fn finish(mut self, stat_type: StatType, limit: usize) -> Report {
        let trend_data = std::mem::take(&mut self.trend);
        match stat_type {
            StatType::PageViews => Report::PageViews(PageViewReport {
                total_views: self.total,
                browsers: self.top("byBrowser", limit),
                os: self.top("byOS", limit),
                devices: self.top("byDevice", limit),
                urls: self.top("byUrl", limit),
                referrers: self.top("byReferrer", limit),
                url_and_browser: self.top("byUrlAndBrowser", limit),
                url_and_device: self.top("byUrlAndDevice", limit),
                url_and_referrer: self.top("byUrlAndReferrer", limit),
                browser_and_os: self.top("byBrowserAndOS", limit),
                by_ip_prefix: self.top("byIPPrefix", limit),
                by_url_and_ip_prefix: self.top("byUrlAndIPPrefix", limit),
                by_user: self.top("byUser", limit),
                by_url_and_user: self.top("byUrlAndUser", limit),
                unique_users: self.unique_users(),
                url_unique_users: self.top_users("byUrlUniqueUsers", limit),
                browser_and_os_unique_users: top_entries_two_levels(
                    &self.user_counts("byBrowserAndOsUniqueUsers"),
                    limit,
                ),
                by_ip_prefix_unique_users: self.top_users("byIPPrefixUniqueUsers", limit),
                trend_data,
            }),
            StatType::Downloads => Report::Downloads(DownloadReport {
                total_downloads: self.total,
                by_file: self.top("byFile", limit),
                by_url: self.top("byUrl", limit),
                by_source_page: self.top("bySourcePage", limit),
                by_file_and_source: self.top("byFileAndSource", limit),
                by_ip_prefix: self.top("byIPPrefix", limit),
                by_file_and_ip_prefix: self.top("byFileAndIPPrefix", limit),
                unique_users: self.unique_users(),
                by_file_unique_users: self.top_users("byFileUniqueUsers", limit),
                by_ip_prefix_unique_users: self.top_users("byIPPrefixUniqueUsers", limit),
                by_user: self.top("byUser", limit),
                trend_data,
            }),
            StatType::Events => Report::Events(EventReport {
                total_events: self.total,
                by_type: self.top("byType", limit),
                by_category: self.top("byCategory", limit),
                by_action: self.top("byAction", limit),
                by_label: self.top("byLabel", limit),
                by_selector: self.top("bySelector", limit),
                by_url: self.top("byUrl", limit),
                by_category_and_action: self.top("byCategoryAndAction", limit),
                by_category_and_label: self.top("byCategoryAndLabel", limit),
                by_url_and_action: self.top("byUrlAndAction", limit),
                by_ip_prefix: self.top("byIPPrefix", limit),
                by_category_and_ip_prefix: self.top("byCategoryAndIPPrefix", limit),
                by_action_and_ip_prefix: self.top("byActionAndIPPrefix", limit),
                unique_users: self.unique_users(),
                by_category_unique_users: self.top_users("byCategoryUniqueUsers", limit),
                by_action_unique_users: self.top_users("byActionUniqueUsers", limit),
                by_ip_prefix_unique_users: self.top_users("byIPPrefixUniqueUsers", limit),
                by_category_and_action_and_user: self.top("byCategoryAndActionAndUser", limit),
                by_user: self.top("byUser", limit),
                trend_data,
            }),
            StatType::Duration => Report::Duration(DurationReport {
                total_duration: self.total,
                total_sessions: self.sessions,
                by_url: self.top_duration("byUrl", limit),
                by_browser: self.top_duration("byBrowser", limit),
                by_os: self.top_duration("byOS", limit),
                by_device: self.top_duration("byDevice", limit),
                by_ip_prefix: self.top_duration("byIPPrefix", limit),
                by_url_and_ip_prefix: self.top_duration("byUrlAndIPPrefix", limit),
                by_user: self.top_duration("byUser", limit),
                by_url_and_user: self.top_duration("byUrlAndUser", limit),
                by_url_and_browser: self.top_duration("byUrlAndBrowser", limit),
                by_url_and_device: self.top_duration("byUrlAndDevice", limit),
                by_browser_and_os: self.top_duration("byBrowserAndOS", limit),
                unique_users: self.unique_users(),
                trend_data,
            }),
        }
    }
}
