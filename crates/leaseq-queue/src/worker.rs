//! Worker pool for item execution.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::item::{QueueItem, ReportOutcome};
use crate::queue::LeaseQueue;

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Item handler trait.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    /// Process one claimed item. An error fails the item.
    async fn handle(&self, item: &QueueItem) -> Result<(), QueueError>;
}

/// A single worker identity.
pub struct Worker {
    id: String,
    running: AtomicBool,
    items_completed: AtomicU64,
    items_failed: AtomicU64,
}

impl Worker {
    /// Create a new worker.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            running: AtomicBool::new(false),
            items_completed: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
        }
    }

    /// Get worker ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if worker is processing an item.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get completed item count.
    pub fn items_completed(&self) -> u64 {
        self.items_completed.load(Ordering::SeqCst)
    }

    /// Get failed item count.
    pub fn items_failed(&self) -> u64 {
        self.items_failed.load(Ordering::SeqCst)
    }

    /// Claim and process one item. Returns `false` when the queue was empty.
    pub async fn run_once<H: ItemHandler + ?Sized>(
        &self,
        handler: &H,
        queue: &LeaseQueue,
    ) -> Result<bool, QueueError> {
        match queue.claim(&self.id).await? {
            Some(item) => {
                self.process(item, handler, queue).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process a claimed item and report the result.
    ///
    /// The handler gets at most the lease duration; past that the item may
    /// already belong to another worker.
    pub async fn process<H: ItemHandler + ?Sized>(
        &self,
        item: QueueItem,
        handler: &H,
        queue: &LeaseQueue,
    ) -> Result<ReportOutcome, QueueError> {
        self.running.store(true, Ordering::SeqCst);
        debug!("Worker {} processing item {}", self.id, item.id);

        let budget = queue.config().lease();

        let result = match tokio::time::timeout(budget, handler.handle(&item)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::ExecutionFailed(format!(
                "lease expired after {:?}",
                budget
            ))),
        };

        let outcome = match result {
            Ok(()) => {
                let outcome = queue.complete(item.id, &self.id).await;
                if matches!(outcome, Ok(ReportOutcome::Completed)) {
                    self.items_completed.fetch_add(1, Ordering::SeqCst);
                }
                outcome
            }
            Err(e) => {
                warn!("Worker {} failed item {}: {}", self.id, item.id, e);
                let message = match e {
                    QueueError::ExecutionFailed(message) => message,
                    other => other.to_string(),
                };
                let outcome = queue.fail(item.id, &self.id, &message).await;
                if matches!(
                    outcome,
                    Ok(ReportOutcome::Requeued { .. } | ReportOutcome::Failed { .. })
                ) {
                    self.items_failed.fetch_add(1, Ordering::SeqCst);
                }
                outcome
            }
        };

        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    /// Claim and process items until shutdown.
    pub async fn run_loop<H: ItemHandler + ?Sized>(
        &self,
        queue: &LeaseQueue,
        handler: &H,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let poll_interval = queue.config().poll_interval();
        debug!("Worker {} started", self.id);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Worker {} shutting down", self.id);
                    break;
                }
                idle = async {
                    match self.run_once(handler, queue).await {
                        Ok(processed) => !processed,
                        Err(e) => {
                            error!("Worker {} error: {}", self.id, e);
                            true
                        }
                    }
                } => {
                    if idle {
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }
    }
}

/// Worker pool for concurrent item execution.
pub struct WorkerPool {
    config: QueueConfig,
    running: Arc<AtomicBool>,
    workers: Vec<Arc<Worker>>,
}

impl WorkerPool {
    /// Create a new worker pool with `config.workers` identities.
    pub fn new(config: QueueConfig) -> Self {
        let workers = (1..=config.workers)
            .map(|n| Arc::new(Worker::new(format!("{}-{}", config.worker_prefix, n))))
            .collect();
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            workers,
        }
    }

    /// Workers in this pool.
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Check if pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Items completed across all workers.
    pub fn total_completed(&self) -> u64 {
        self.workers.iter().map(|w| w.items_completed()).sum()
    }

    /// Items failed across all workers.
    pub fn total_failed(&self) -> u64 {
        self.workers.iter().map(|w| w.items_failed()).sum()
    }

    /// Run every worker plus periodic retention until shutdown.
    pub async fn run(
        &self,
        queue: Arc<LeaseQueue>,
        handler: Arc<dyn ItemHandler>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        self.running.store(true, Ordering::SeqCst);
        info!("Worker pool started with {} workers", self.workers.len());

        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let queue = queue.clone();
            let handler = handler.clone();
            let rx = shutdown_rx.resubscribe();
            tasks.spawn(async move {
                worker.run_loop(queue.as_ref(), handler.as_ref(), rx).await;
            });
        }

        let retention_days = self.config.retention_days;
        let cleanup_interval = self.config.cleanup_interval();
        let mut rx = shutdown_rx.resubscribe();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.cleanup(retention_days).await {
                            error!("Retention cleanup failed: {}", e);
                        }
                    }
                }
            }
        });
        drop(shutdown_rx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task panicked: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            "Worker pool stopped ({} completed, {} failed)",
            self.total_completed(),
            self.total_failed()
        );
    }
}
