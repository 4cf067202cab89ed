//! Read-side analytics: counter merging, Top-N ranking, report shapes and the
//! aggregation engine that ties them to the shard store.

pub mod aggregation;
pub mod cache;
pub mod merge;
pub mod report;
pub mod top_n;

pub use aggregation::{ReportEngine, DEFAULT_LIMIT};
pub use cache::{CacheKey, ReportCache};
pub use report::{
    Breakdown, DownloadReport, DurationReport, EventReport, PageViewReport, Report, TrendPoint,
};
pub use top_n::{top_entries, top_entries_two_levels};
