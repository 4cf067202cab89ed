//! Turning tracking payloads into shard deltas.
//!
//! Each event kind produces one fixed update shape against the shard
//! `(system, day, type)`. Every user supplied dimension value is sanitized
//! before it becomes a path segment, and fingerprints are hashed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{PageMonitorError, Result};
use crate::sanitize::{sanitize_fingerprint, sanitize_key, sanitize_opt, UNKNOWN_KEY};
use crate::types::{ShardKey, StatType, DATE_FORMAT};
use crate::update::UpdateOps;

pub const DEFAULT_SYSTEM: &str = "default";

/// Per-request values shared by every event kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingContext {
    /// Sanitized system id.
    pub system: String,
    /// Hashed fingerprint, or `anonymous`.
    pub user_fingerprint: String,
    /// Sanitized first two octets of the client address.
    pub ip_prefix: String,
    pub timestamp: DateTime<Utc>,
}

impl TrackingContext {
    pub fn new(
        system: Option<&str>,
        fingerprint: Option<&str>,
        client_ip: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            system: sanitize_key(system.unwrap_or(DEFAULT_SYSTEM)),
            user_fingerprint: sanitize_fingerprint(fingerprint.unwrap_or("")),
            ip_prefix: ip_prefix(client_ip),
            timestamp,
        }
    }

    /// UTC day the event lands in.
    pub fn date(&self) -> String {
        self.timestamp.format(DATE_FORMAT).to_string()
    }
}

/// First two dot-separated segments of an address, sanitized. Addresses
/// without a dot (IPv6, garbage) map to `unknown`.
pub fn ip_prefix(ip: &str) -> String {
    if !ip.contains('.') {
        return UNKNOWN_KEY.to_string();
    }
    let prefix: Vec<&str> = ip.split('.').take(2).collect();
    sanitize_key(&prefix.join("."))
}

/// Client address: the first `X-Forwarded-For` entry when present, else the peer.
pub fn client_ip_from_forwarded(forwarded_for: Option<&str>, peer: &str) -> String {
    forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(peer)
        .to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageView {
    pub url: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Download {
    pub download_url: Option<String>,
    pub file_name: Option<String>,
    pub source_page: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomEvent {
    pub event_type: Option<String>,
    pub event_category: Option<String>,
    pub event_action: Option<String>,
    pub event_label: Option<String>,
    pub selector: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DurationSample {
    /// Time on page; negative values count as 0.
    pub duration: i64,
    pub url: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackingEvent {
    Pageview(PageView),
    Download(Download),
    Event(CustomEvent),
    Duration(DurationSample),
}

impl TrackingEvent {
    pub fn stat_type(&self) -> StatType {
        match self {
            TrackingEvent::Pageview(_) => StatType::PageViews,
            TrackingEvent::Download(_) => StatType::Downloads,
            TrackingEvent::Event(_) => StatType::Events,
            TrackingEvent::Duration(_) => StatType::Duration,
        }
    }

    /// The shard this event lands in and the delta to apply to it.
    pub fn build_update(&self, ctx: &TrackingContext) -> (ShardKey, UpdateOps) {
        let stat_type = self.stat_type();
        let mut ops = match self {
            TrackingEvent::Pageview(p) => page_view_ops(p, ctx),
            TrackingEvent::Download(d) => download_ops(d, ctx),
            TrackingEvent::Event(e) => event_ops(e, ctx),
            TrackingEvent::Duration(d) => duration_ops(d, ctx),
        };
        let date = ctx.date();
        ops.set("system", ctx.system.as_str())
            .set("date", date.as_str())
            .set("type", stat_type.as_str())
            .set(
                "lastUpdated",
                ctx.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        (ShardKey::new(ctx.system.clone(), date, stat_type), ops)
    }
}

fn path(segments: &[&str]) -> String {
    let mut p = String::from("data");
    for s in segments {
        p.push('.');
        p.push_str(s);
    }
    p
}

fn page_view_ops(p: &PageView, ctx: &TrackingContext) -> UpdateOps {
    let url: &str = &sanitize_opt(p.url.as_deref());
    let browser: &str = &sanitize_opt(p.browser.as_deref());
    let os: &str = &sanitize_opt(p.os.as_deref());
    let device: &str = &sanitize_opt(p.device.as_deref());
    let referrer: &str = &sanitize_opt(p.referrer.as_deref());
    let ip = ctx.ip_prefix.as_str();
    let user = ctx.user_fingerprint.as_str();

    let mut ops = UpdateOps::new();
    ops.inc(path(&["total"]), 1)
        .inc(path(&["byUrl", url]), 1)
        .inc(path(&["byBrowser", browser]), 1)
        .inc(path(&["byOS", os]), 1)
        .inc(path(&["byDevice", device]), 1)
        .inc(path(&["byIPPrefix", ip]), 1)
        .inc(path(&["byUrlAndIPPrefix", url, ip]), 1)
        .inc(path(&["byUser", user]), 1)
        .inc(path(&["byUrlAndUser", url, user]), 1)
        .inc(path(&["byUrlAndBrowser", url, browser]), 1)
        .inc(path(&["byUrlAndDevice", url, device]), 1)
        .inc(path(&["byBrowserAndOS", browser, os]), 1)
        .inc(path(&["byReferrer", referrer]), 1)
        .inc(path(&["byUrlAndReferrer", url, referrer]), 1)
        .add_to_set(path(&["uniqueUsers"]), user)
        .add_to_set(path(&["byUrlUniqueUsers", url]), user)
        .add_to_set(path(&["byIPPrefixUniqueUsers", ip]), user)
        .add_to_set(path(&["byBrowserAndOsUniqueUsers", browser, os]), user);
    ops
}

fn download_ops(d: &Download, ctx: &TrackingContext) -> UpdateOps {
    let url: &str = &sanitize_opt(d.download_url.as_deref());
    let file: &str = &sanitize_opt(d.file_name.as_deref());
    let source: &str = &sanitize_opt(d.source_page.as_deref());
    let ip = ctx.ip_prefix.as_str();
    let user = ctx.user_fingerprint.as_str();

    let mut ops = UpdateOps::new();
    ops.inc(path(&["total"]), 1)
        .inc(path(&["byFile", file]), 1)
        .inc(path(&["byUrl", url]), 1)
        .inc(path(&["bySourcePage", source]), 1)
        .inc(path(&["byIPPrefix", ip]), 1)
        .inc(path(&["byFileAndIPPrefix", file, ip]), 1)
        .inc(path(&["byUser", user]), 1)
        .inc(path(&["byFileAndUser", file, user]), 1)
        .inc(path(&["byFileAndSource", file, source]), 1)
        .add_to_set(path(&["uniqueUsers"]), user)
        .add_to_set(path(&["byFileUniqueUsers", file]), user)
        .add_to_set(path(&["byIPPrefixUniqueUsers", ip]), user);
    ops
}

fn or_default(value: Option<&str>, default: &str) -> String {
    sanitize_key(value.unwrap_or(default))
}

fn event_ops(e: &CustomEvent, ctx: &TrackingContext) -> UpdateOps {
    let event_type: &str = &or_default(e.event_type.as_deref(), "click");
    let category: &str = &or_default(e.event_category.as_deref(), "engagement");
    let action: &str = &or_default(e.event_action.as_deref(), "click");
    let label: &str = &sanitize_opt(e.event_label.as_deref());
    let selector: &str = &sanitize_opt(e.selector.as_deref());
    let url: &str = &sanitize_opt(e.url.as_deref());
    let ip = ctx.ip_prefix.as_str();
    let user = ctx.user_fingerprint.as_str();

    let mut ops = UpdateOps::new();
    ops.inc(path(&["total"]), 1)
        .inc(path(&["byType", event_type]), 1)
        .inc(path(&["byCategory", category]), 1)
        .inc(path(&["byAction", action]), 1)
        .inc(path(&["byLabel", label]), 1)
        .inc(path(&["bySelector", selector]), 1)
        .inc(path(&["byUrl", url]), 1)
        .inc(path(&["byIPPrefix", ip]), 1)
        .inc(path(&["byCategoryAndIPPrefix", category, ip]), 1)
        .inc(path(&["byActionAndIPPrefix", action, ip]), 1)
        .inc(path(&["byUser", user]), 1)
        .inc(path(&["byCategoryAndUser", category, user]), 1)
        .inc(path(&["byCategoryAndActionAndUser", category, action, user]), 1)
        .inc(path(&["byCategoryAndAction", category, action]), 1)
        .inc(path(&["byCategoryAndLabel", category, label]), 1)
        .inc(path(&["byUrlAndAction", url, action]), 1)
        .add_to_set(path(&["uniqueUsers"]), user)
        .add_to_set(path(&["byCategoryUniqueUsers", category]), user)
        .add_to_set(path(&["byActionUniqueUsers", action]), user)
        .add_to_set(path(&["byIPPrefixUniqueUsers", ip]), user);
    ops
}

/// Duration dimensions keep the summed time at `<dim>.<key...>` and the
/// session count at `<dim>.count.<key...>`.
pub const DURATION_DIMENSIONS: [&str; 11] = [
    "byUrl",
    "byBrowser",
    "byOS",
    "byDevice",
    "byIPPrefix",
    "byUrlAndIPPrefix",
    "byUser",
    "byUrlAndUser",
    "byUrlAndBrowser",
    "byUrlAndDevice",
    "byBrowserAndOS",
];

fn duration_ops(d: &DurationSample, ctx: &TrackingContext) -> UpdateOps {
    let duration = d.duration.max(0);
    let url: &str = &sanitize_opt(d.url.as_deref());
    let browser: &str = &sanitize_opt(d.browser.as_deref());
    let os: &str = &sanitize_opt(d.os.as_deref());
    let device: &str = &sanitize_opt(d.device.as_deref());
    let ip = ctx.ip_prefix.as_str();
    let user = ctx.user_fingerprint.as_str();

    // one key list per entry of DURATION_DIMENSIONS, in the same order
    let keys: [Vec<&str>; 11] = [
        vec![url],
        vec![browser],
        vec![os],
        vec![device],
        vec![ip],
        vec![url, ip],
        vec![user],
        vec![url, user],
        vec![url, browser],
        vec![url, device],
        vec![browser, os],
    ];

    let mut ops = UpdateOps::new();
    ops.inc(path(&["total"]), duration).inc(path(&["count"]), 1);
    for (dim, keys) in DURATION_DIMENSIONS.iter().zip(&keys) {
        let mut sum_path = vec![*dim];
        sum_path.extend(keys.iter().copied());
        let mut count_path = vec![*dim, "count"];
        count_path.extend(keys.iter().copied());
        ops.inc(path(&sum_path), duration).inc(path(&count_path), 1);
    }
    ops.add_to_set(path(&["uniqueUsers"]), user)
        .add_to_set(path(&["byUrlUniqueUsers", url]), user)
        .add_to_set(path(&["byIPPrefixUniqueUsers", ip]), user);
    ops
}

/// One line of a tracking log: the event plus request metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRecord {
    pub event: TrackingEvent,
    pub context: TrackingContext,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RecordMeta {
    system: Option<String>,
    user_fingerprint: Option<String>,
    client_ip: Option<String>,
    forwarded_for: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl TrackingRecord {
    /// Parse a JSON tracking payload. `now` is used when the payload carries
    /// no `timestamp`.
    pub fn from_json(value: &Value, now: DateTime<Utc>) -> Result<Self> {
        let event: TrackingEvent = serde_json::from_value(value.clone())
            .map_err(|e| PageMonitorError::InvalidUpdate(format!("bad tracking event: {}", e)))?;
        let meta: RecordMeta = serde_json::from_value(value.clone())?;
        let ip = client_ip_from_forwarded(
            meta.forwarded_for.as_deref(),
            meta.client_ip.as_deref().unwrap_or(""),
        );
        let context = TrackingContext::new(
            meta.system.as_deref(),
            meta.user_fingerprint.as_deref(),
            &ip,
            meta.timestamp.unwrap_or(now),
        );
        Ok(Self { event, context })
    }

    pub fn build_update(&self) -> (ShardKey, UpdateOps) {
        self.event.build_update(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> TrackingContext {
        TrackingContext::new(
            Some("acme"),
            Some("user-1"),
            "192.168.1.20",
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap(),
        )
    }

    #[test]
    fn ip_prefix_keeps_two_octets_sanitized() {
        assert_eq!(ip_prefix("192.168.1.20"), "192_dot_168");
        assert_eq!(ip_prefix("::1"), "unknown");
        assert_eq!(ip_prefix(""), "unknown");
    }

    #[test]
    fn forwarded_header_wins() {
        assert_eq!(client_ip_from_forwarded(Some("1.2.3.4, 10.0.0.1"), "9.9.9.9"), "1.2.3.4");
        assert_eq!(client_ip_from_forwarded(Some("  "), "9.9.9.9"), "9.9.9.9");
        assert_eq!(client_ip_from_forwarded(None, "9.9.9.9"), "9.9.9.9");
    }

    #[test]
    fn context_sanitizes_and_hashes() {
        let c = TrackingContext::new(Some("my.site"), None, "10.0.0.1", Utc::now());
        assert_eq!(c.system, "my_dot_site");
        assert_eq!(c.user_fingerprint, "anonymous");
        assert_eq!(TrackingContext::new(None, None, "", Utc::now()).system, "default");
        assert_eq!(ctx().user_fingerprint, sanitize_fingerprint("user-1"));
        assert_eq!(ctx().date(), "2024-01-01");
    }

    #[test]
    fn page_view_shape() {
        let event: TrackingEvent = serde_json::from_value(json!({
            "type": "pageview", "url": "http://a.b/x$y", "browser": "Chrome", "os": "Mac"
        }))
        .unwrap();
        let (key, ops) = event.build_update(&ctx());
        assert_eq!(key, ShardKey::new("acme", "2024-01-01", StatType::PageViews));

        let user = ctx().user_fingerprint;
        let url = "http://a_dot_b/x_dollar_y";
        assert_eq!(ops.inc["data.total"], 1);
        assert_eq!(ops.inc[&format!("data.byUrl.{url}")], 1);
        assert_eq!(ops.inc["data.byDevice.unknown"], 1);
        assert_eq!(ops.inc["data.byReferrer.unknown"], 1);
        assert_eq!(ops.inc["data.byBrowserAndOS.Chrome.Mac"], 1);
        assert_eq!(ops.inc[&format!("data.byUrlAndUser.{url}.{user}")], 1);
        assert_eq!(ops.inc["data.byIPPrefix.192_dot_168"], 1);
        assert_eq!(ops.inc.len(), 14);
        assert_eq!(ops.add_to_set.len(), 4);
        assert!(ops.add_to_set.contains_key("data.byBrowserAndOsUniqueUsers.Chrome.Mac"));
        assert_eq!(ops.set["system"], json!("acme"));
        assert_eq!(ops.set["type"], json!("pageViews"));
        assert_eq!(ops.set["lastUpdated"], json!("2024-01-01T12:30:00.000Z"));
    }

    #[test]
    fn download_shape() {
        let event = TrackingEvent::Download(Download {
            download_url: Some("/files/a.pdf".into()),
            file_name: Some("a.pdf".into()),
            source_page: None,
        });
        let (key, ops) = event.build_update(&ctx());
        assert_eq!(key.stat_type, StatType::Downloads);
        assert_eq!(ops.inc["data.byFile.a_dot_pdf"], 1);
        assert_eq!(ops.inc["data.byFileAndSource.a_dot_pdf.unknown"], 1);
        assert_eq!(ops.inc.len(), 9);
        assert_eq!(ops.add_to_set.len(), 3);
    }

    #[test]
    fn event_defaults() {
        let event: TrackingEvent = serde_json::from_value(json!({"type": "event"})).unwrap();
        let (key, ops) = event.build_update(&ctx());
        assert_eq!(key.stat_type, StatType::Events);
        assert_eq!(ops.inc["data.byType.click"], 1);
        assert_eq!(ops.inc["data.byCategoryAndAction.engagement.click"], 1);
        assert_eq!(ops.inc["data.byLabel.unknown"], 1);
        assert_eq!(ops.inc.len(), 16);
        assert_eq!(ops.add_to_set.len(), 4);
    }

    #[test]
    fn duration_uniform_count_shape() {
        let event: TrackingEvent = serde_json::from_value(json!({
            "type": "duration", "duration": 42, "url": "/home"
        }))
        .unwrap();
        let (key, ops) = event.build_update(&ctx());
        assert_eq!(key.stat_type, StatType::Duration);
        assert_eq!(ops.inc["data.total"], 42);
        assert_eq!(ops.inc["data.count"], 1);
        assert_eq!(ops.inc["data.byUrl./home"], 42);
        assert_eq!(ops.inc["data.byUrl.count./home"], 1);
        assert_eq!(ops.inc["data.byBrowserAndOS.count.unknown.unknown"], 1);
        assert_eq!(ops.inc.len(), 2 + 2 * DURATION_DIMENSIONS.len());
        for dim in DURATION_DIMENSIONS {
            let count_prefix = format!("data.{dim}.count.");
            assert!(ops.inc.keys().any(|k| k.starts_with(&count_prefix)), "{dim} has no count");
        }
        assert_eq!(ops.add_to_set.len(), 3);
    }

    #[test]
    fn negative_duration_clamped() {
        let event = TrackingEvent::Duration(DurationSample {
            duration: -5,
            ..Default::default()
        });
        let (_, ops) = event.build_update(&ctx());
        assert_eq!(ops.inc["data.total"], 0);
        assert_eq!(ops.inc["data.count"], 1);
    }

    #[test]
    fn record_parses_metadata() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let record = TrackingRecord::from_json(
            &json!({
                "type": "pageview",
                "system": "acme",
                "userFingerprint": "u1",
                "forwardedFor": "8.8.4.4, 10.0.0.1",
                "clientIp": "127.0.0.1",
                "timestamp": "2024-01-05T10:00:00Z",
                "url": "/home"
            }),
            now,
        )
        .unwrap();
        assert_eq!(record.context.ip_prefix, "8_dot_8");
        assert_eq!(record.context.date(), "2024-01-05");
        let (key, _) = record.build_update();
        assert_eq!(key.date, "2024-01-05");

        let no_ts = TrackingRecord::from_json(&json!({"type": "download"}), now).unwrap();
        assert_eq!(no_ts.context.date(), "2024-03-01");
    }

    #[test]
    fn record_rejects_unknown_type() {
        let err = TrackingRecord::from_json(&json!({"type": "click"}), Utc::now()).unwrap_err();
        assert!(matches!(err, PageMonitorError::InvalidUpdate(_)));
    }
}
