//! Detail-fetch worker pool
//!
//! A fixed set of tokio tasks drains an in-process queue of detail-fetch
//! tasks: skip what the caches already answer, fetch the rest through the
//! rate-limited client, record the outcome. A single failing record never
//! aborts the pool, and every task is acknowledged so `drain` cannot
//! deadlock on one bad id.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::collector::RunStats;
use crate::error::{ClientResult, CollectError, CollectResult};
use crate::progress::{ProgressEvent, ProgressSink};

/// Queue poll interval; bounds how long shutdown waits on an idle worker.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Seam between the worker pool and the HTTP layer.
///
/// `Ok(None)` is the normal not-found outcome; `Err` is a terminal fetch
/// failure for this record within the run.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_detail(&self, record_id: &str, save_path: &Path)
        -> ClientResult<Option<Value>>;
}

/// One unit of detail-fetch work.
#[derive(Debug, Clone)]
pub struct DetailTask {
    pub record_id: String,
    pub save_path: PathBuf,
    /// Document of the individual the record was selected for
    pub owner_document: String,
}

/// Tasks submitted but not yet acknowledged.
#[derive(Debug, Default)]
struct PendingGauge {
    count: Mutex<usize>,
    idle: Notify,
}

impl PendingGauge {
    fn inc(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_waiters();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap()
    }

    async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.current() == 0 {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            // re-check periodically in case a notify raced the count read
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL.min(deadline - now)) => {}
            }
        }
    }
}

struct WorkerContext {
    fetcher: Arc<dyn DetailFetcher>,
    cache: Arc<CacheStore>,
    stats: Arc<RunStats>,
    sink: ProgressSink,
    pending: Arc<PendingGauge>,
}

/// Fixed-size pool of detail-fetch workers.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<DetailTask>>,
    pending: Arc<PendingGauge>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers over a bounded queue of `queue_capacity`.
    pub fn start(
        size: usize,
        queue_capacity: usize,
        fetcher: Arc<dyn DetailFetcher>,
        cache: Arc<CacheStore>,
        stats: Arc<RunStats>,
        sink: ProgressSink,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(PendingGauge::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(size.max(1));
        for worker_id in 0..size.max(1) {
            let ctx = WorkerContext {
                fetcher: Arc::clone(&fetcher),
                cache: Arc::clone(&cache),
                stats: Arc::clone(&stats),
                sink: Arc::clone(&sink),
                pending: Arc::clone(&pending),
            };
            let rx = Arc::clone(&rx);
            let shutdown_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, rx, shutdown_rx, ctx)));
        }

        Self {
            tx: Some(tx),
            pending,
            shutdown_tx,
            handles,
        }
    }

    /// Enqueue a task; blocks when the queue is full.
    pub async fn submit(&self, task: DetailTask) -> CollectResult<()> {
        let Some(tx) = &self.tx else {
            return Err(CollectError::State("worker pool is shut down".to_string()));
        };
        self.pending.inc();
        if tx.send(task).await.is_err() {
            self.pending.dec();
            return Err(CollectError::State(
                "worker pool queue is closed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.current()
    }

    /// Wait until every submitted task was acknowledged. Returns false on
    /// timeout.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.pending.wait_idle(limit).await
    }

    /// Stop pulling new tasks and join every worker. In-flight tasks run to
    /// completion.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.tx.take(); // close the queue
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DetailTask>>>,
    shutdown_rx: watch::Receiver<bool>,
    ctx: WorkerContext,
) {
    debug!(worker_id, "detail worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let task = {
            let mut rx = rx.lock().await;
            match timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) => break, // queue closed and fully drained
                Err(_) => continue, // poll timeout, re-check shutdown
            }
        };
        process_task(&ctx, &task).await;
        // acknowledged regardless of outcome
        ctx.pending.dec();
    }
    debug!(worker_id, "detail worker stopped");
}

async fn process_task(ctx: &WorkerContext, task: &DetailTask) {
    if ctx.cache.is_known_missing(&task.record_id) {
        ctx.stats.inc_details_404();
        return;
    }
    if task.save_path.is_file() {
        ctx.cache.add_completed(&task.record_id, "ok");
        ctx.stats.inc_details_cached();
        return;
    }
    match ctx
        .fetcher
        .fetch_detail(&task.record_id, &task.save_path)
        .await
    {
        Ok(Some(_)) => {
            ctx.cache.add_completed(&task.record_id, "ok");
            ctx.stats.inc_details_ok();
            (ctx.sink)(&ProgressEvent::DetailOk {
                record_id: task.record_id.clone(),
            });
        }
        Ok(None) => {
            ctx.cache.add_missing(&task.record_id);
            ctx.stats.inc_details_404();
        }
        Err(err) => {
            warn!(
                record_id = %task.record_id,
                owner = %task.owner_document,
                error = %err,
                "detail fetch failed"
            );
            ctx.cache.add_missing(&task.record_id);
            ctx.stats.inc_errors();
        }
    }
}
