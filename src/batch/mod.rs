//! Write-side batching: a bounded queue of per-event deltas, coalesced by shard
//! and committed as unordered bulk writes by a single background worker.

mod metrics;
mod processor;

use serde::Serialize;

pub use crate::config::BatchConfig;
pub use metrics::BatchMetrics;
pub use processor::{BatchProcessor, FlushOutcome, QueuedUpdate};

pub(crate) const STATE_STOPPED: u8 = 0;
pub(crate) const STATE_RUNNING: u8 = 1;
pub(crate) const STATE_DRAINING: u8 = 2;

/// Processor lifecycle:
///   Stopped  --[start]--> Running
///   Running  --[stop]---> Draining
///   Draining --[residual queue flushed or drain timeout]--> Stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    #[default]
    Stopped,
    Running,
    Draining,
}

impl ProcessorState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_RUNNING => ProcessorState::Running,
            STATE_DRAINING => ProcessorState::Draining,
            _ => ProcessorState::Stopped,
        }
    }
}
