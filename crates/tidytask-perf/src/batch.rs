use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tidytask_core::{BatchConfig, Result, TidyTaskError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// A single queued logical write.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub kind: String,
    pub item_id: Uuid,
    pub fields: HashMap<String, Value>,
    pub enqueued_at: Instant,
}

/// Receives the full batch accumulated for one kind since the last flush.
pub type FlushHandler = Arc<dyn Fn(Vec<PendingUpdate>) -> Result<()> + Send + Sync>;

/// Coalesces many small updates into fewer flush calls, per update kind.
///
/// Updates land in one shared pending list; grouping by kind happens once
/// per flush rather than once per enqueue, which keeps the enqueue path a
/// single lock and append. A flush fires inline when the list reaches
/// `batch_size`, or after `flush_interval` of quiet time — each enqueue
/// restarts that timer (debounce, not a fixed window).
///
/// Cheap to clone; clones share the same pending list and handlers.
#[derive(Clone)]
pub struct UpdateBatcher {
    config: BatchConfig,
    pending: Arc<Mutex<Vec<PendingUpdate>>>,
    handlers: Arc<RwLock<HashMap<String, FlushHandler>>>,
    flush_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UpdateBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            pending: Arc::new(Mutex::new(Vec::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            flush_timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Associate `kind` with a flush handler.
    ///
    /// One handler per kind; re-registering replaces the previous handler
    /// (last writer wins). An empty kind is rejected.
    pub fn register_flush_handler<F>(&self, kind: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Vec<PendingUpdate>) -> Result<()> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(TidyTaskError::InvalidKey(
                "flush handler kind must not be empty".to_string(),
            ));
        }
        self.handlers.write().insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Queue one update.
    ///
    /// Flushes inline once `batch_size` updates are pending; otherwise
    /// restarts the deferred flush timer, measured from this enqueue.
    /// Must be called from within a tokio runtime.
    pub fn queue_update(
        &self,
        kind: impl Into<String>,
        item_id: Uuid,
        fields: HashMap<String, Value>,
    ) {
        let update = PendingUpdate {
            kind: kind.into(),
            item_id,
            fields,
            enqueued_at: Instant::now(),
        };

        let pending_len = {
            let mut pending = self.pending.lock();
            pending.push(update);
            pending.len()
        };

        if pending_len >= self.config.batch_size {
            self.cancel_timer();
            self.flush();
        } else {
            self.schedule_flush();
        }
    }

    /// Flush everything pending right now.
    pub fn force_flush(&self) {
        self.flush();
    }

    /// Number of updates waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Flush any remaining updates and cancel the outstanding timer.
    pub fn shutdown(&self) {
        self.flush();
        self.cancel_timer();
    }

    /// Restart the debounce timer so the interval runs from the most
    /// recent enqueue.
    fn schedule_flush(&self) {
        let batcher = self.clone();
        let interval = self.config.flush_interval();

        let mut timer = self.flush_timer.lock();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            batcher.flush();
        }));
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.flush_timer.lock().take() {
            handle.abort();
        }
    }

    /// Partition the pending list by kind and hand each partition to its
    /// handler. Handlers run outside every lock; a failing handler is
    /// logged and never aborts the other kinds' partitions.
    fn flush(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return;
        }

        let mut by_kind: HashMap<String, Vec<PendingUpdate>> = HashMap::new();
        for update in drained {
            by_kind.entry(update.kind.clone()).or_default().push(update);
        }

        for (kind, batch) in by_kind {
            let handler = self.handlers.read().get(&kind).cloned();
            match handler {
                Some(handler) => {
                    let count = batch.len();
                    if let Err(e) = handler(batch) {
                        warn!(%kind, count, error = %e, "batch flush handler failed");
                    } else {
                        debug!(%kind, count, "flushed update batch");
                    }
                }
                None => {
                    debug!(%kind, count = batch.len(), "dropping batch with no registered handler");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Flushed = Arc<Mutex<Vec<Vec<PendingUpdate>>>>;

    fn recording_batcher(config: BatchConfig, kind: &str) -> (UpdateBatcher, Flushed) {
        let batcher = UpdateBatcher::new(config);
        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        batcher
            .register_flush_handler(kind, move |batch| {
                sink.lock().push(batch);
                Ok(())
            })
            .unwrap();
        (batcher, flushed)
    }

    fn fields(name: &str) -> HashMap<String, Value> {
        HashMap::from([(name.to_string(), Value::Bool(true))])
    }

    #[test]
    fn empty_kind_is_rejected() {
        let batcher = UpdateBatcher::new(BatchConfig::default());
        assert!(batcher.register_flush_handler("", |_| Ok(())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_batch_size_flushes_inline_in_order() {
        let config = BatchConfig {
            batch_size: 3,
            flush_interval_ms: 10_000,
        };
        let (batcher, flushed) = recording_batcher(config, "todo");

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        batcher.queue_update("todo", ids[0], fields("done"));
        batcher.queue_update("todo", ids[1], fields("title"));
        assert!(flushed.lock().is_empty());
        assert_eq!(batcher.pending_len(), 2);

        batcher.queue_update("todo", ids[2], fields("due"));

        let batches = flushed.lock();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 3);
        let got: Vec<Uuid> = batch.iter().map(|u| u.item_id).collect();
        assert_eq!(got, ids);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_triggers_deferred_flush() {
        let config = BatchConfig {
            batch_size: 50,
            flush_interval_ms: 50,
        };
        let (batcher, flushed) = recording_batcher(config, "todo");

        batcher.queue_update("todo", Uuid::new_v4(), fields("done"));
        batcher.queue_update("todo", Uuid::new_v4(), fields("title"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = flushed.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn re_enqueue_restarts_the_debounce_window() {
        let config = BatchConfig {
            batch_size: 50,
            flush_interval_ms: 100,
        };
        let (batcher, flushed) = recording_batcher(config, "todo");

        batcher.queue_update("todo", Uuid::new_v4(), fields("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        batcher.queue_update("todo", Uuid::new_v4(), fields("b"));

        // 120ms after the first enqueue, but only 60ms after the second.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(flushed.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let batches = flushed.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_does_not_abort_other_kinds() {
        let config = BatchConfig {
            batch_size: 4,
            flush_interval_ms: 10_000,
        };
        let batcher = UpdateBatcher::new(config);

        batcher
            .register_flush_handler("todo", |_| {
                Err(TidyTaskError::Callback("storage offline".to_string()))
            })
            .unwrap();

        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        batcher
            .register_flush_handler("subtask", move |batch| {
                sink.lock().push(batch);
                Ok(())
            })
            .unwrap();

        batcher.queue_update("todo", Uuid::new_v4(), fields("a"));
        batcher.queue_update("subtask", Uuid::new_v4(), fields("b"));
        batcher.queue_update("todo", Uuid::new_v4(), fields("c"));
        batcher.queue_update("subtask", Uuid::new_v4(), fields("d"));

        let batches = flushed.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flushing_nothing_is_a_no_op() {
        let (batcher, flushed) = recording_batcher(BatchConfig::default(), "todo");
        batcher.force_flush();
        assert!(flushed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn updates_without_a_handler_are_dropped() {
        let (batcher, flushed) = recording_batcher(BatchConfig::default(), "todo");
        batcher.queue_update("unknown", Uuid::new_v4(), fields("x"));
        batcher.force_flush();
        assert!(flushed.lock().is_empty());
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_remaining_updates() {
        let config = BatchConfig {
            batch_size: 50,
            flush_interval_ms: 10_000,
        };
        let (batcher, flushed) = recording_batcher(config, "todo");

        batcher.queue_update("todo", Uuid::new_v4(), fields("done"));
        batcher.shutdown();

        assert_eq!(flushed.lock().len(), 1);
        assert_eq!(batcher.pending_len(), 0);
    }
}
