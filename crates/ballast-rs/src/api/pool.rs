//! Bounded-parallel executor for independent calls.
//!
//! [`WorkerPool::process`] runs a batch of [`WorkItem`]s with at most
//! `max_concurrent` in flight and returns one [`WorkResult`] per item in
//! **completion order**. Callers that need submission order re-sort by id.
//!
//! The pool never fails fast: every item runs (or is cancelled) and its
//! outcome is reported individually. A panicking item becomes that item's
//! [`WorkError::Panicked`] instead of tearing down the batch.
//!
//! Cancellation is cooperative. Items still waiting for a slot when the
//! token fires finish immediately with [`WorkError::Cancelled`] without
//! running; items already running get a child token and decide for
//! themselves when to stop.

use crate::api::classify::BoxError;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum items in flight. Default: 8. Values below 1 become 1.
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

impl PoolConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }
}

type WorkFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;
type WorkFn<T> = Box<dyn FnOnce(CancellationToken) -> WorkFuture<T> + Send>;

/// One unit of independent work.
pub struct WorkItem<T> {
    id: String,
    run: WorkFn<T>,
}

impl<T> WorkItem<T> {
    /// `run` receives a child of the batch's cancellation token.
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Box::new(move |token| Box::pin(run(token))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("id", &self.id).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("cancelled before start")]
    Cancelled,
    #[error(transparent)]
    Failed(BoxError),
    #[error("work item panicked: {0}")]
    Panicked(String),
}

/// Outcome of one [`WorkItem`].
#[derive(Debug)]
pub struct WorkResult<T> {
    pub id: String,
    pub result: Result<T, WorkError>,
}

impl<T> WorkResult<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs batches of [`WorkItem`]s with bounded parallelism.
///
/// A pool holds only its configuration; every `process` call gets its own
/// slots, so concurrent batches do not share a limit.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config: PoolConfig {
                max_concurrent: config.max_concurrent.max(1),
            },
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Run every item and collect results in completion order.
    pub async fn process<T>(
        &self,
        items: Vec<WorkItem<T>>,
        cancel: &CancellationToken,
    ) -> Vec<WorkResult<T>>
    where
        T: Send + 'static,
    {
        self.process_with_progress(items, cancel, |_, _| {}).await
    }

    /// Like [`process`](Self::process), calling `progress(completed, total)`
    /// once per finished item.
    pub async fn process_with_progress<T, P>(
        &self,
        items: Vec<WorkItem<T>>,
        cancel: &CancellationToken,
        mut progress: P,
    ) -> Vec<WorkResult<T>>
    where
        T: Send + 'static,
        P: FnMut(usize, usize),
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }
        debug!(
            "Worker pool: {} item(s), max_concurrent={}",
            total, self.config.max_concurrent
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut set = JoinSet::new();
        let mut task_ids = HashMap::with_capacity(total);

        for item in items {
            let WorkItem { id, run } = item;
            let slots = Arc::clone(&slots);
            let token = cancel.clone();
            let item_id = id.clone();
            let handle = set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = slots.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return WorkResult {
                        id: item_id,
                        result: Err(WorkError::Cancelled),
                    };
                };
                let child = token.child_token();
                let outcome = AssertUnwindSafe(async move { run(child).await })
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(WorkError::Failed(e)),
                    Err(panic) => Err(WorkError::Panicked(panic_message(panic.as_ref()))),
                };
                WorkResult {
                    id: item_id,
                    result,
                }
            });
            task_ids.insert(handle.id(), id);
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Panics are caught inside the task, so this is an abort.
                    let id = task_ids.remove(&e.id()).unwrap_or_default();
                    warn!("Worker pool: task for item '{id}' did not complete: {e}");
                    WorkResult {
                        id,
                        result: Err(WorkError::Panicked(e.to_string())),
                    }
                }
            };
            results.push(result);
            progress(results.len(), total);
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        debug!(
            "Worker pool: {} item(s) done, {} failed",
            results.len(),
            failed
        );
        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let pool = WorkerPool::new(PoolConfig::default().with_max_concurrent(3));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<WorkItem<usize>> = (0..20)
            .map(|i| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                WorkItem::new(format!("item-{i}"), move |_token| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let results = pool.process(items, &CancellationToken::new()).await;
        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let pool = WorkerPool::default();
        let results: Vec<WorkResult<()>> = pool.process(Vec::new(), &CancellationToken::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_every_item() {
        let pool = WorkerPool::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem<()>> = (0..5)
            .map(|i| {
                let ran = Arc::clone(&ran);
                WorkItem::new(i.to_string(), move |_| async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = pool.process(items, &cancel).await;
        assert_eq!(results.len(), 5);
        assert!(
            results
                .iter()
                .all(|r| matches!(r.result, Err(WorkError::Cancelled)))
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_item_reported_once_despite_failures() {
        let pool = WorkerPool::new(PoolConfig::default().with_max_concurrent(4));
        let items: Vec<WorkItem<u32>> = (0..10u32)
            .map(|i| {
                WorkItem::new(format!("{i}"), move |_| async move {
                    if i % 3 == 0 {
                        Err(format!("item {i} failed").into())
                    } else {
                        Ok(i * 10)
                    }
                })
            })
            .collect();

        let results = pool.process(items, &CancellationToken::new()).await;
        let mut ids: Vec<u32> = results.iter().map(|r| r.id.parse().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());

        let failures: Vec<_> = results.iter().filter(|r| !r.is_ok()).collect();
        assert_eq!(failures.len(), 4);
        for f in failures {
            let msg = f.result.as_ref().unwrap_err().to_string();
            assert_eq!(msg, format!("item {} failed", f.id));
        }
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        let pool = WorkerPool::new(PoolConfig::default().with_max_concurrent(2));
        let items = vec![
            WorkItem::new("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok("slow")
            }),
            WorkItem::new("fast", |_| async { Ok("fast") }),
        ];
        let results = pool.process(items, &CancellationToken::new()).await;
        let order: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn progress_called_once_per_completion() {
        let pool = WorkerPool::default();
        let seen = Mutex::new(Vec::new());
        let items: Vec<WorkItem<()>> = (0..4)
            .map(|i| WorkItem::new(i.to_string(), |_| async { Ok(()) }))
            .collect();
        pool.process_with_progress(items, &CancellationToken::new(), |done, total| {
            seen.lock().unwrap().push((done, total));
        })
        .await;
        assert_eq!(
            seen.into_inner().unwrap(),
            vec![(1, 4), (2, 4), (3, 4), (4, 4)]
        );
    }

    #[tokio::test]
    async fn panic_reported_as_item_error() {
        let pool = WorkerPool::default();
        let items: Vec<WorkItem<()>> = vec![
            WorkItem::new("boom", |_| async { panic!("kaboom") }),
            WorkItem::new("fine", |_| async { Ok(()) }),
        ];
        let results = pool.process(items, &CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        let boom = results.iter().find(|r| r.id == "boom").unwrap();
        match &boom.result {
            Err(WorkError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("expected panic error, got {other:?}"),
        }
        assert!(results.iter().find(|r| r.id == "fine").unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_mid_batch_skips_waiting_items() {
        let pool = WorkerPool::new(PoolConfig::default().with_max_concurrent(1));
        let cancel = CancellationToken::new();
        // Whichever item gets the only slot cancels the batch.
        let items: Vec<WorkItem<String>> = (0..4)
            .map(|i| {
                let trigger = cancel.clone();
                WorkItem::new(format!("item-{i}"), move |token| async move {
                    trigger.cancel();
                    assert!(token.is_cancelled());
                    Ok(format!("item-{i}"))
                })
            })
            .collect();

        let results = pool.process(items, &cancel).await;
        assert_eq!(results.len(), 4);
        let finished: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].result.as_ref().unwrap(), &finished[0].id);
        let skipped = results
            .iter()
            .filter(|r| matches!(r.result, Err(WorkError::Cancelled)))
            .count();
        assert_eq!(skipped, 3);
    }

    #[test]
    fn zero_concurrency_corrected_to_one() {
        assert_eq!(WorkerPool::new(PoolConfig { max_concurrent: 0 }).max_concurrent(), 1);
        assert_eq!(PoolConfig::default().with_max_concurrent(0).max_concurrent, 1);
    }
}
