use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PageMonitorError;

/// Tracked site or application identifier, already sanitized.
pub type SystemId = String;

/// Date format used for shard partitioning (UTC calendar day).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The four kinds of statistics a system accumulates, one shard per kind per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatType {
    #[serde(rename = "pageViews")]
    PageViews,
    #[serde(rename = "downloads")]
    Downloads,
    #[serde(rename = "events")]
    Events,
    #[serde(rename = "duration")]
    Duration,
}

impl StatType {
    pub const ALL: [StatType; 4] = [
        StatType::PageViews,
        StatType::Downloads,
        StatType::Events,
        StatType::Duration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatType::PageViews => "pageViews",
            StatType::Downloads => "downloads",
            StatType::Events => "events",
            StatType::Duration => "duration",
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatType {
    type Err = PageMonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pageViews" | "pageview" => Ok(StatType::PageViews),
            "downloads" | "download" => Ok(StatType::Downloads),
            "events" | "event" => Ok(StatType::Events),
            "duration" => Ok(StatType::Duration),
            other => Err(PageMonitorError::UnknownStatType(other.to_string())),
        }
    }
}

/// Primary key of a stat shard: one document per (system, date, type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub system: SystemId,
    pub date: String,
    #[serde(rename = "type")]
    pub stat_type: StatType,
}

impl ShardKey {
    pub fn new(system: impl Into<String>, date: impl Into<String>, stat_type: StatType) -> Self {
        Self {
            system: system.into(),
            date: date.into(),
            stat_type,
        }
    }

    /// A key with an empty system or date cannot target a shard.
    pub fn is_complete(&self) -> bool {
        !self.system.is_empty() && !self.date.is_empty()
    }

    /// Filter document matching exactly this shard.
    pub fn to_filter(&self) -> serde_json::Value {
        serde_json::json!({
            "system": self.system,
            "date": self.date,
            "type": self.stat_type.as_str(),
        })
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.system, self.date, self.stat_type)
    }
}

/// Check that `date` is a real calendar day in `YYYY-MM-DD` form.
pub fn validate_date(date: &str) -> crate::error::Result<()> {
    chrono::NaiveDate::parse_from_str(date, DATE_FORMAT)
        .map(|_| ())
        .map_err(|_| PageMonitorError::InvalidDate(date.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_type_serde_names() {
        assert_eq!(
            serde_json::to_value(StatType::PageViews).unwrap(),
            serde_json::json!("pageViews")
        );
        let parsed: StatType = serde_json::from_str("\"duration\"").unwrap();
        assert_eq!(parsed, StatType::Duration);
    }

    #[test]
    fn stat_type_from_str_accepts_singular_aliases() {
        assert_eq!("pageview".parse::<StatType>().unwrap(), StatType::PageViews);
        assert_eq!("downloads".parse::<StatType>().unwrap(), StatType::Downloads);
        assert!("clicks".parse::<StatType>().is_err());
    }

    #[test]
    fn shard_key_filter_uses_store_field_names() {
        let key = ShardKey::new("acme", "2024-01-01", StatType::Events);
        assert_eq!(
            key.to_filter(),
            serde_json::json!({"system": "acme", "date": "2024-01-01", "type": "events"})
        );
        assert_eq!(key.to_string(), "(acme, 2024-01-01, events)");
    }

    #[test]
    fn incomplete_key_detected() {
        assert!(!ShardKey::new("", "2024-01-01", StatType::Events).is_complete());
        assert!(!ShardKey::new("acme", "", StatType::Events).is_complete());
        assert!(ShardKey::new("acme", "2024-01-01", StatType::Events).is_complete());
    }

    #[test]
    fn validate_date_rejects_bad_input() {
        assert!(validate_date("2024-02-29").is_ok());
        assert!(validate_date("2023-02-29").is_err());
        assert!(validate_date("2024/01/01").is_err());
        assert!(validate_date("").is_err());
    }
}
