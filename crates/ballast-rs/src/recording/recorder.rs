//! Non-blocking, two-phase conversation recorder.
//!
//! [`ConversationRecorder::save_pending`] writes a `Pending` record inline
//! before the model call. [`ConversationRecorder::record_completion`] queues
//! the outcome for a single background worker and returns immediately:
//!
//! - if the pending insert succeeded, the worker issues an update;
//! - if it failed, the worker issues one full insert instead.
//!
//! The queue is bounded. When it is full the newest completion is dropped
//! with a warning; producers never wait. Storage failures are logged and
//! counted, never propagated.
//!
//! ```ignore
//! let recorder = ConversationRecorder::new(Arc::new(store), RecorderConfig::default());
//! let pending = recorder.save_pending(record).await;
//! // ... make the call ...
//! recorder.record_completion(pending, &completion);
//! recorder.close().await;
//! ```

use super::{Completion, ConversationRecord, ConversationStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default completion queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Completions that may wait for the worker. Default: 256. Minimum: 1.
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RecorderConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Snapshot of recorder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Completions accepted onto the queue.
    pub enqueued: u64,
    /// Completions rejected because the queue was full or closed.
    pub dropped: u64,
    /// Completions the worker wrote successfully.
    pub persisted: u64,
    /// Completions the worker failed to write.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// A record saved (or not) by [`ConversationRecorder::save_pending`],
/// waiting for its outcome.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub record: ConversationRecord,
    /// Whether the pending insert reached the store.
    pub persisted: bool,
}

#[derive(Debug)]
enum Job {
    Update(ConversationRecord),
    Insert(ConversationRecord),
}

impl Job {
    fn record(&self) -> &ConversationRecord {
        match self {
            Job::Update(r) | Job::Insert(r) => r,
        }
    }
}

pub struct ConversationRecorder {
    store: Arc<dyn ConversationStore>,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ConversationRecorder {
    /// Create a recorder and spawn its worker. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Arc<dyn ConversationStore>, config: RecorderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(store.clone(), rx, counters.clone()));
        Self {
            store,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Insert `record` as `Pending`. A storage failure is logged and
    /// reflected in [`PendingRecord::persisted`]; it never fails the caller.
    pub async fn save_pending(&self, record: ConversationRecord) -> PendingRecord {
        let persisted = match persist(self.store.as_ref(), &Job::Insert(record.clone())).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save pending record {}: {e}", record.id);
                false
            }
        };
        PendingRecord { record, persisted }
    }

    /// Apply `completion` and queue the write. Never blocks; if the queue is
    /// full or the recorder is closed the completion is dropped.
    pub fn record_completion(&self, pending: PendingRecord, completion: &Completion) {
        let PendingRecord {
            mut record,
            persisted,
        } = pending;
        record.apply(completion);
        let job = if persisted {
            Job::Update(record)
        } else {
            Job::Insert(record)
        };

        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            warn!(
                "Recorder closed; dropping completion for {}",
                job.record().id
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(job)) => {
                warn!(
                    "Recorder queue full; dropping completion for {}",
                    job.record().id
                );
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    "Recorder worker gone; dropping completion for {}",
                    job.record().id
                );
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Stop accepting completions and wait for the queue to drain.
    /// Idempotent.
    pub async fn close(&self) {
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!("Recorder worker ended abnormally: {e}");
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConversationRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRecorder")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    store: Arc<dyn ConversationStore>,
    mut rx: mpsc::Receiver<Job>,
    counters: Arc<Counters>,
) {
    debug!("Recorder worker started");
    while let Some(job) = rx.recv().await {
        match persist(store.as_ref(), &job).await {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Failed to persist record {}: {e}", job.record().id);
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    info!(
        "Recorder drained: {} persisted, {} failed, {} dropped",
        counters.persisted.load(Ordering::Relaxed),
        counters.failed.load(Ordering::Relaxed),
        counters.dropped.load(Ordering::Relaxed),
    );
}

/// One write inside its own tenant scope. The scope is released when this
/// returns, success or not.
async fn persist(store: &dyn ConversationStore, job: &Job) -> Result<(), super::StoreError> {
    let record = job.record();
    let scope = store.tenant_scope(&record.project_id).await?;
    match job {
        Job::Update(r) => store.update(&scope, r).await,
        Job::Insert(r) => store.save(&scope, r).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::recording::{MemoryStore, RecordStatus};
    use std::time::Duration;

    fn record(project: &str) -> ConversationRecord {
        ConversationRecord::pending(project, "m", "http://x", 1, vec![Message::user("q")], None)
    }

    fn success() -> Completion {
        Completion::Success {
            content: "a".into(),
            usage: None,
            duration: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn pending_then_update() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ConversationRecorder::new(store.clone(), RecorderConfig::default());

        let pending = recorder.save_pending(record("p")).await;
        assert!(pending.persisted);
        let id = pending.record.id.clone();
        assert_eq!(store.get(&id).unwrap().status, RecordStatus::Pending);

        recorder.record_completion(pending, &success());
        recorder.close().await;

        assert_eq!(store.get(&id).unwrap().status, RecordStatus::Success);
        assert_eq!(store.insert_count(), 1);
        assert_eq!(store.update_count(), 1);
        assert_eq!(recorder.stats().persisted, 1);
    }

    #[tokio::test]
    async fn failed_pending_falls_back_to_single_insert() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_saves(1);
        let recorder = ConversationRecorder::new(store.clone(), RecorderConfig::default());

        let pending = recorder.save_pending(record("p")).await;
        assert!(!pending.persisted);
        let id = pending.record.id.clone();

        recorder.record_completion(pending, &success());
        recorder.close().await;

        let stored = store.get(&id).unwrap();
        assert_eq!(stored.status, RecordStatus::Success);
        assert_eq!(store.insert_count(), 1);
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn every_write_releases_its_scope() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ConversationRecorder::new(store.clone(), RecorderConfig::default());
        for project in ["a", "b", "c"] {
            let pending = recorder.save_pending(record(project)).await;
            recorder.record_completion(pending, &success());
        }
        recorder.close().await;
        assert_eq!(store.scopes_acquired(), 6);
        assert_eq!(store.scopes_released(), 6);
    }

    #[tokio::test]
    async fn completion_after_close_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let recorder = ConversationRecorder::new(store.clone(), RecorderConfig::default());
        let pending = recorder.save_pending(record("p")).await;
        recorder.close().await;
        recorder.close().await;

        recorder.record_completion(pending, &success());
        let stats = recorder.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.enqueued, 0);
    }
}
