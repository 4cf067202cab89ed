//! Report shapes returned by the aggregation engine, one per statistics type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::StatType;

/// A ranked breakdown: dimension key to count (or to a nested breakdown).
pub type Breakdown = Map<String, Value>;

/// One day of the trend series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: String,
    pub total: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_users: Option<u64>,
    /// Session count; only duration trends carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    /// Per-day top breakdown (`byUrl`, `byFile` or `byCategoryAndAction`).
    #[serde(flatten)]
    pub breakdown: Breakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewReport {
    pub total_views: i64,
    pub browsers: Breakdown,
    pub os: Breakdown,
    pub devices: Breakdown,
    pub urls: Breakdown,
    pub referrers: Breakdown,
    pub url_and_browser: Breakdown,
    pub url_and_device: Breakdown,
    pub url_and_referrer: Breakdown,
    #[serde(rename = "browserAndOS")]
    pub browser_and_os: Breakdown,
    #[serde(rename = "byIPPrefix")]
    pub by_ip_prefix: Breakdown,
    #[serde(rename = "byUrlAndIPPrefix")]
    pub by_url_and_ip_prefix: Breakdown,
    pub by_user: Breakdown,
    pub by_url_and_user: Breakdown,
    pub unique_users: u64,
    pub url_unique_users: Breakdown,
    #[serde(rename = "browserAndOSUniqueUsers")]
    pub browser_and_os_unique_users: Breakdown,
    #[serde(rename = "byIPPrefixUniqueUsers")]
    pub by_ip_prefix_unique_users: Breakdown,
    pub trend_data: Vec<TrendPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    pub total_downloads: i64,
    pub by_file: Breakdown,
    pub by_url: Breakdown,
    pub by_source_page: Breakdown,
    pub by_file_and_source: Breakdown,
    #[serde(rename = "byIPPrefix")]
    pub by_ip_prefix: Breakdown,
    #[serde(rename = "byFileAndIPPrefix")]
    pub by_file_and_ip_prefix: Breakdown,
    pub unique_users: u64,
    pub by_file_unique_users: Breakdown,
    #[serde(rename = "byIPPrefixUniqueUsers")]
    pub by_ip_prefix_unique_users: Breakdown,
    pub by_user: Breakdown,
    pub trend_data: Vec<TrendPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventReport {
    pub total_events: i64,
    pub by_type: Breakdown,
    pub by_category: Breakdown,
    pub by_action: Breakdown,
    pub by_label: Breakdown,
    pub by_selector: Breakdown,
    pub by_url: Breakdown,
    pub by_category_and_action: Breakdown,
    pub by_category_and_label: Breakdown,
    pub by_url_and_action: Breakdown,
    #[serde(rename = "byIPPrefix")]
    pub by_ip_prefix: Breakdown,
    #[serde(rename = "byCategoryAndIPPrefix")]
    pub by_category_and_ip_prefix: Breakdown,
    #[serde(rename = "byActionAndIPPrefix")]
    pub by_action_and_ip_prefix: Breakdown,
    pub unique_users: u64,
    pub by_category_unique_users: Breakdown,
    pub by_action_unique_users: Breakdown,
    #[serde(rename = "byIPPrefixUniqueUsers")]
    pub by_ip_prefix_unique_users: Breakdown,
    pub by_category_and_action_and_user: Breakdown,
    pub by_user: Breakdown,
    pub trend_data: Vec<TrendPoint>,
}

/// Duration breakdowns map each key to summed time, with a `count` entry
/// holding the session count per retained key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationReport {
    pub total_duration: i64,
    pub total_sessions: i64,
    pub by_url: Breakdown,
    pub by_browser: Breakdown,
    #[serde(rename = "byOS")]
    pub by_os: Breakdown,
    pub by_device: Breakdown,
    #[serde(rename = "byIPPrefix")]
    pub by_ip_prefix: Breakdown,
    #[serde(rename = "byUrlAndIPPrefix")]
    pub by_url_and_ip_prefix: Breakdown,
    pub by_user: Breakdown,
    pub by_url_and_user: Breakdown,
    pub by_url_and_browser: Breakdown,
    pub by_url_and_device: Breakdown,
    #[serde(rename = "byBrowserAndOS")]
    pub by_browser_and_os: Breakdown,
    pub unique_users: u64,
    pub trend_data: Vec<TrendPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Report {
    PageViews(PageViewReport),
    Downloads(DownloadReport),
    Events(EventReport),
    Duration(DurationReport),
}

impl Report {
    pub fn stat_type(&self) -> StatType {
        match self {
            Report::PageViews(_) => StatType::PageViews,
            Report::Downloads(_) => StatType::Downloads,
            Report::Events(_) => StatType::Events,
            Report::Duration(_) => StatType::Duration,
        }
    }

    pub fn trend(&self) -> &[TrendPoint] {
        match self {
            Report::PageViews(r) => &r.trend_data,
            Report::Downloads(r) => &r.trend_data,
            Report::Events(r) => &r.trend_data,
            Report::Duration(r) => &r.trend_data,
        }
    }

    /// Headline number: views, downloads, events or summed duration.
    pub fn total(&self) -> i64 {
        match self {
            Report::PageViews(r) => r.total_views,
            Report::Downloads(r) => r.total_downloads,
            Report::Events(r) => r.total_events,
            Report::Duration(r) => r.total_duration,
        }
    }

    pub fn unique_users(&self) -> u64 {
        match self {
            Report::PageViews(r) => r.unique_users,
            Report::Downloads(r) => r.unique_users,
            Report::Events(r) => r.unique_users,
            Report::Duration(r) => r.unique_users,
        }
    }

    pub fn as_page_views(&self) -> Option<&PageViewReport> {
        match self {
            Report::PageViews(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_downloads(&self) -> Option<&DownloadReport> {
        match self {
            Report::Downloads(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_events(&self) -> Option<&EventReport> {
        match self {
            Report::Events(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<&DurationReport> {
        match self {
            Report::Duration(r) => Some(r),
            _ => None,
        }
    }
}
