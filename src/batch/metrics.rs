use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ProcessorState;

/// Point-in-time view of processor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetrics {
    /// Items drained from the queue by flushes, before coalescing.
    pub total_processed: u64,
    /// Failed write operations plus flush tasks that failed outright.
    pub total_errors: u64,
    pub queue_size: usize,
    pub last_flush_time: Option<DateTime<Utc>>,
    /// Average number of coalesced shard writes per flush.
    pub avg_batch_size: f64,
    pub total_batches: u64,
    pub avg_flush_duration_ms: f64,
    pub rejects_due_to_full_queue: u64,
    pub dropped_after_max_retries: u64,
    /// Failed updates discarded because the processor was stopping.
    pub dropped_on_shutdown: u64,
    pub dropped_invalid: u64,
    pub retries_in_flight: usize,
    pub state: ProcessorState,
}

/// Counters behind their own lock, never held across an await.
#[derive(Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<BatchMetrics>,
}

impl MetricsRecorder {
    fn with<R>(&self, f: impl FnOnce(&mut BatchMetrics) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn record_flush(&self, drained: usize, written: usize, elapsed: Duration) {
        self.with(|m| {
            m.total_processed += drained as u64;
            m.total_batches += 1;
            let n = m.total_batches as f64;
            m.avg_batch_size += (written as f64 - m.avg_batch_size) / n;
            let ms = elapsed.as_secs_f64() * 1000.0;
            m.avg_flush_duration_ms += (ms - m.avg_flush_duration_ms) / n;
            m.last_flush_time = Some(Utc::now());
        });
    }

    pub fn record_errors(&self, count: usize) {
        self.with(|m| m.total_errors += count as u64);
    }

    pub fn record_reject(&self) {
        self.with(|m| m.rejects_due_to_full_queue += 1);
    }

    pub fn record_drop(&self) {
        self.with(|m| m.dropped_after_max_retries += 1);
    }

    pub fn record_shutdown_drop(&self) {
        self.with(|m| m.dropped_on_shutdown += 1);
    }

    pub fn record_invalid(&self, count: usize) {
        self.with(|m| m.dropped_invalid += count as u64);
    }

    pub fn snapshot(
        &self,
        queue_size: usize,
        retries_in_flight: usize,
        state: ProcessorState,
    ) -> BatchMetrics {
        self.with(|m| BatchMetrics {
            queue_size,
            retries_in_flight,
            state,
            ..m.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_averages() {
        let rec = MetricsRecorder::default();
        rec.record_flush(10, 4, Duration::from_millis(10));
        rec.record_flush(6, 2, Duration::from_millis(30));
        let m = rec.snapshot(0, 0, ProcessorState::Running);
        assert_eq!(m.total_processed, 16);
        assert_eq!(m.total_batches, 2);
        assert!((m.avg_batch_size - 3.0).abs() < 1e-9);
        assert!((m.avg_flush_duration_ms - 20.0).abs() < 1e-6);
        assert!(m.last_flush_time.is_some());
    }

    #[test]
    fn snapshot_carries_live_fields() {
        let rec = MetricsRecorder::default();
        rec.record_reject();
        rec.record_drop();
        rec.record_shutdown_drop();
        rec.record_invalid(2);
        rec.record_errors(3);
        let m = rec.snapshot(7, 1, ProcessorState::Draining);
        assert_eq!(m.queue_size, 7);
        assert_eq!(m.retries_in_flight, 1);
        assert_eq!(m.state, ProcessorState::Draining);
        assert_eq!(m.rejects_due_to_full_queue, 1);
        assert_eq!(m.dropped_after_max_retries, 1);
        assert_eq!(m.dropped_on_shutdown, 1);
        assert_eq!(m.dropped_invalid, 2);
        assert_eq!(m.total_errors, 3);
    }

    #[test]
    fn serializes_camel_case() {
        let m = MetricsRecorder::default().snapshot(0, 0, ProcessorState::Stopped);
        let v = serde_json::to_value(m).unwrap();
        assert_eq!(v["rejectsDueToFullQueue"], 0);
        assert_eq!(v["state"], "stopped");
        assert!(v["lastFlushTime"].is_null());
    }
}
