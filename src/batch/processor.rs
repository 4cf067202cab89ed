use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use super::metrics::{BatchMetrics, MetricsRecorder};
use super::{ProcessorState, STATE_DRAINING, STATE_RUNNING, STATE_STOPPED};
use crate::config::BatchConfig;
use crate::error::{PageMonitorError, Result};
use crate::store::{StatStore, WriteModel};
use crate::tracking::TrackingRecord;
use crate::types::ShardKey;
use crate::update::UpdateOps;

/// One delta waiting to be written, with the number of retries it has used.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpdate {
    pub key: ShardKey,
    pub ops: UpdateOps,
    pub attempts: u32,
}

impl QueuedUpdate {
    pub fn new(key: ShardKey, ops: UpdateOps) -> Self {
        Self { key, ops, attempts: 0 }
    }

    /// Items that can never be written: no retry slot is spent on them.
    fn is_valid(&self) -> bool {
        self.key.is_complete() && !self.ops.is_empty()
    }
}

/// Summary of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    /// Items taken off the queue.
    pub drained: usize,
    /// Distinct shard writes sent to the store after coalescing.
    pub written: usize,
    pub failed: usize,
    pub dropped_invalid: usize,
    pub retries_scheduled: usize,
    pub dropped_after_max_retries: usize,
    /// Failed while the processor was stopping; no retry was spent on them.
    pub dropped_on_shutdown: usize,
    /// The bulk call itself failed, so every write in it failed.
    pub store_failed: bool,
}

/// Bounded queue plus single background worker that coalesces deltas per shard
/// and commits them with unordered bulk writes.
///
/// Cloning is cheap and shares the same queue and worker.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    config: BatchConfig,
    store: Arc<dyn StatStore>,
    state: AtomicU8,
    tx: mpsc::Sender<QueuedUpdate>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueuedUpdate>>,
    flush_signal: Notify,
    /// Wakes sleeping retry tasks when the processor stops.
    shutdown: Notify,
    metrics: MetricsRecorder,
    retries_in_flight: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn StatStore>, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                state: AtomicU8::new(STATE_STOPPED),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                flush_signal: Notify::new(),
                shutdown: Notify::new(),
                metrics: MetricsRecorder::default(),
                retries_in_flight: AtomicUsize::new(0),
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ProcessorState {
        self.inner.state()
    }

    /// Spawn the worker. Must be called from within a tokio runtime.
    /// Does nothing unless the processor is stopped.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_STOPPED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("[BATCH] start ignored, state={:?}", self.state());
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_worker().await });
        *self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::info!(
            "Batch processor started: flush_size={}, flush_interval={:?}, capacity={}",
            self.inner.config.flush_size,
            self.inner.config.flush_interval,
            self.inner.config.queue_capacity
        );
    }

    /// Queue one delta for `key`.
    ///
    /// Returns `false` when the processor is not running, or when the queue
    /// stayed full for `submit_timeout`.
    pub async fn submit_event(&self, key: ShardKey, ops: UpdateOps) -> bool {
        self.inner.submit(QueuedUpdate::new(key, ops)).await.is_ok()
    }

    /// Like [`submit_event`](Self::submit_event) but reports why a submit failed.
    pub async fn try_submit(&self, key: ShardKey, ops: UpdateOps) -> Result<()> {
        if self.state() != ProcessorState::Running {
            return Err(PageMonitorError::NotRunning);
        }
        self.inner
            .submit(QueuedUpdate::new(key.clone(), ops))
            .await
            .map_err(|_| PageMonitorError::QueueFull(key.to_string()))
    }

    /// Build the shard delta for a tracking record and queue it.
    pub async fn track(&self, record: &TrackingRecord) -> bool {
        let (key, ops) = record.build_update();
        self.submit_event(key, ops).await
    }

    /// Drain and write one batch now. With `force` unset an empty queue returns
    /// without touching the receiver.
    pub async fn flush(&self, force: bool) -> FlushOutcome {
        self.inner.flush(force).await
    }

    /// Stop accepting submits, let the worker finish, then flush what is left.
    /// Everything after the state change, including the wait for the worker and
    /// for pending retry tasks, shares one `drain_timeout` deadline.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(STATE_RUNNING, STATE_DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let deadline = Instant::now() + inner.config.drain_timeout;
        tracing::info!("Stopping batch processor, queue={}", inner.queue_len());
        inner.flush_signal.notify_one();
        inner.shutdown.notify_waiters();

        let handle = inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("[BATCH] worker ended abnormally: {}", e),
                Err(_) => {
                    tracing::warn!(
                        "[BATCH] worker still busy after {:?}, aborting it, {} items left in queue",
                        inner.config.drain_timeout,
                        inner.queue_len()
                    );
                    handle.abort();
                }
            }
        }

        while inner.queue_len() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "[BATCH] drain gave up after {:?}, {} items left in queue",
                    inner.config.drain_timeout,
                    inner.queue_len()
                );
                break;
            }
            match timeout_at(deadline, inner.flush_in_task(true)).await {
                Ok(Some(outcome)) if outcome.drained == 0 => tokio::task::yield_now().await,
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        "[BATCH] drain timed out after {:?}, {} items left in queue",
                        inner.config.drain_timeout,
                        inner.queue_len()
                    );
                    break;
                }
            }
        }

        // woken retry tasks drop their item and exit
        while inner.retries_in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "[BATCH] {} retry tasks still pending at shutdown",
                    inner.retries_in_flight.load(Ordering::Acquire)
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        inner.state.store(STATE_STOPPED, Ordering::Release);
        tracing::info!("Batch processor stopped");
    }

    /// Wait until the queue is empty. Returns `false` on timeout.
    pub async fn wait_for_empty_queue(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.inner.queue_len() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!("[BATCH] timed out waiting for empty queue");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue_len()
    }

    pub fn metrics(&self) -> BatchMetrics {
        self.inner.metrics.snapshot(
            self.inner.queue_len(),
            self.inner.retries_in_flight.load(Ordering::Acquire),
            self.inner.state(),
        )
    }
}

impl Inner {
    fn state(&self) -> ProcessorState {
        ProcessorState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Enqueue, waiting up to `submit_timeout` for room. A rejected item is
    /// handed back.
    async fn submit(&self, item: QueuedUpdate) -> std::result::Result<(), QueuedUpdate> {
        if !self.is_running() {
            tracing::warn!("[BATCH] submit while {:?}, rejecting {}", self.state(), item.key);
            return Err(item);
        }

        let item = match self.tx.try_send(item) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(item)) => Some(item),
            Err(mpsc::error::TrySendError::Closed(item)) => return Err(item),
        };
        if let Some(item) = item {
            match timeout(self.config.submit_timeout, self.tx.reserve()).await {
                Ok(Ok(permit)) => permit.send(item),
                Ok(Err(_)) => return Err(item),
                Err(_) => {
                    tracing::warn!("[BATCH] queue full, rejecting {} after {:?}", item.key, self.config.submit_timeout);
                    self.metrics.record_reject();
                    return Err(item);
                }
            }
        }

        if self.queue_len() >= self.config.flush_size {
            self.flush_signal.notify_one();
        }
        Ok(())
    }

    async fn run_worker(self: Arc<Self>) {
        let interval = self.config.flush_interval;
        let mut last_flush = Instant::now();

        while self.is_running() {
            let deadline = last_flush + interval;
            tracing::trace!(
                "[BATCH] waiting, queue={}, deadline_in={}ms",
                self.queue_len(),
                deadline.saturating_duration_since(Instant::now()).as_millis()
            );
            let _ = timeout_at(deadline, self.flush_signal.notified()).await;
            if !self.is_running() {
                break;
            }

            let depth = self.queue_len();
            let interval_elapsed = last_flush.elapsed() >= interval;
            if depth >= self.config.flush_size || (interval_elapsed && depth > 0) {
                tracing::debug!("[BATCH] flushing, queue={}, by_size={}", depth, depth >= self.config.flush_size);
                self.flush_in_task(false).await;
                last_flush = Instant::now();
            } else if interval_elapsed {
                last_flush = Instant::now();
            }
        }

        if self.queue_len() > 0 {
            tracing::debug!("[BATCH] final flush, queue={}", self.queue_len());
            self.flush_in_task(true).await;
        }
        tracing::debug!("[BATCH] worker exiting");
    }

    /// Run one flush as its own task so a panic cannot take the worker down.
    async fn flush_in_task(self: &Arc<Self>, force: bool) -> Option<FlushOutcome> {
        let inner = Arc::clone(self);
        match tokio::spawn(async move { inner.flush(force).await }).await {
            Ok(outcome) => {
                if outcome.store_failed {
                    tokio::time::sleep(self.config.error_cooldown).await;
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::error!("[BATCH] flush task failed: {}", e);
                self.metrics.record_errors(1);
                tokio::time::sleep(self.config.error_cooldown).await;
                None
            }
        }
    }

    async fn flush(self: &Arc<Self>, force: bool) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if !force && self.queue_len() == 0 {
            return outcome;
        }
        let started = Instant::now();

        let max_items = self.config.flush_size * 2;
        let mut drained = Vec::with_capacity(max_items.min(self.queue_len()));
        {
            let mut rx = self.rx.lock().await;
            while drained.len() < max_items {
                match rx.try_recv() {
                    Ok(item) => drained.push(item),
                    Err(_) => break,
                }
            }
        }
        if drained.is_empty() {
            return outcome;
        }
        outcome.drained = drained.len();

        let mut merged: IndexMap<ShardKey, QueuedUpdate> = IndexMap::new();
        for item in drained {
            if !item.is_valid() {
                tracing::warn!("[BATCH] dropping malformed item for {}", item.key);
                outcome.dropped_invalid += 1;
                continue;
            }
            match merged.get_mut(&item.key) {
                Some(existing) => {
                    existing.ops.merge_from(item.ops);
                    existing.attempts = existing.attempts.max(item.attempts);
                }
                None => {
                    merged.insert(item.key.clone(), item);
                }
            }
        }
        if outcome.dropped_invalid > 0 {
            self.metrics.record_invalid(outcome.dropped_invalid);
        }

        let items: Vec<QueuedUpdate> = merged.into_values().collect();
        outcome.written = items.len();
        if !items.is_empty() {
            let models: Vec<WriteModel> = items
                .iter()
                .map(|item| WriteModel::upsert(item.key.clone(), item.ops.clone()))
                .collect();

            let failed: Vec<QueuedUpdate> = match self.store.bulk_write(&models).await {
                Ok(result) if result.is_complete() => {
                    tracing::debug!(
                        "[BATCH] bulk write ok: ops={}, matched={}, upserted={}",
                        models.len(),
                        result.matched,
                        result.upserted
                    );
                    Vec::new()
                }
                Ok(result) => {
                    let failed_idx: HashSet<usize> = result.failed_indices().into_iter().collect();
                    tracing::warn!(
                        "[BATCH] partial bulk failure: success={}, failed={}",
                        models.len().saturating_sub(failed_idx.len()),
                        failed_idx.len()
                    );
                    items
                        .into_iter()
                        .enumerate()
                        .filter(|(i, _)| failed_idx.contains(i))
                        .map(|(_, item)| item)
                        .collect()
                }
                Err(e) => {
                    tracing::error!("[BATCH] bulk write of {} ops failed: {}", models.len(), e);
                    outcome.store_failed = true;
                    items
                }
            };

            outcome.failed = failed.len();
            if !failed.is_empty() {
                self.metrics.record_errors(failed.len());
                self.handle_failed(failed, &mut outcome);
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_flush(outcome.drained, outcome.written, elapsed);
        if elapsed > self.config.slow_flush_threshold {
            tracing::warn!("[BATCH] flush of {} items took {:?}", outcome.drained, elapsed);
        }
        outcome
    }

    fn handle_failed(self: &Arc<Self>, failed: Vec<QueuedUpdate>, outcome: &mut FlushOutcome) {
        for item in failed {
            if item.attempts >= self.config.max_retry_attempts {
                self.drop_item(&item, "max retries reached");
                outcome.dropped_after_max_retries += 1;
                continue;
            }
            if !self.is_running() {
                self.drop_on_shutdown(&item);
                outcome.dropped_on_shutdown += 1;
                continue;
            }
            outcome.retries_scheduled += 1;
            self.retries_in_flight.fetch_add(1, Ordering::AcqRel);
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.retry(item).await;
                inner.retries_in_flight.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    /// Back off, then put `item` back on the queue with one more attempt.
    /// A full queue still uses up the attempt.
    async fn retry(&self, mut item: QueuedUpdate) {
        loop {
            if item.attempts >= self.config.max_retry_attempts {
                self.drop_item(&item, "max retries reached");
                return;
            }
            let delay = self.config.retry_delay(item.attempts);
            // created before the state check so a stop() in between still wakes it
            let shutdown = self.shutdown.notified();
            if self.is_running() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown => {}
                }
            }
            if !self.is_running() {
                self.drop_on_shutdown(&item);
                return;
            }

            item.attempts += 1;
            let attempt = item.attempts;
            match self.submit(item).await {
                Ok(()) => {
                    tracing::debug!("[BATCH] retry {} queued after {:?}", attempt, delay);
                    return;
                }
                Err(rejected) if !self.is_running() => {
                    self.drop_on_shutdown(&rejected);
                    return;
                }
                Err(rejected) => {
                    tracing::warn!("[BATCH] retry {} for {} rejected by full queue", attempt, rejected.key);
                    item = rejected;
                }
            }
        }
    }

    fn drop_on_shutdown(&self, item: &QueuedUpdate) {
        self.metrics.record_shutdown_drop();
        tracing::warn!(
            "[BATCH] dropping update for {} after {} attempts: processor stopping",
            item.key,
            item.attempts
        );
    }

    fn drop_item(&self, item: &QueuedUpdate, reason: &str) {
        self.metrics.record_drop();
        tracing::error!(
            "[BATCH] dropping update for {} after {} attempts: {}",
            item.key,
            item.attempts,
            reason
        );
    }
}
