//! pagemonitor: ingestion and reporting core for website analytics.
//!
//! Tracking events become per-shard update documents ([`tracking`]), which the
//! [`batch::BatchProcessor`] coalesces and writes through a [`store::StatStore`].
//! Reports are rolled up on read by [`analytics::ReportEngine`].

pub mod analytics;
pub mod batch;
pub mod config;
pub mod error;
pub mod sanitize;
pub mod store;
pub mod tracking;
pub mod types;
pub mod update;

#[cfg(test)]
mod integ_tests;

pub use analytics::{Report, ReportEngine};
pub use batch::{BatchMetrics, BatchProcessor, ProcessorState};
pub use config::{BatchConfig, Config, ReportConfig};
pub use error::{PageMonitorError, Result};
pub use store::{MemoryStore, StatStore};
pub use tracking::{TrackingContext, TrackingEvent, TrackingRecord};
pub use types::{ShardKey, StatType};
pub use update::UpdateOps;
