//! Lease queue: claim protocol, reporting, stats and retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::item::{IgnoreReason, ItemId, ItemStatus, Lease, NewItem, QueueItem, ReportOutcome};
use crate::retry::RetryPolicy;
use crate::store::{ItemStore, MemoryItemStore, QueueStats, SqliteItemStore, Transition};

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

/// Priority queue whose items are handed to workers under time-bounded leases.
pub struct LeaseQueue {
    config: QueueConfig,
    store: Arc<dyn ItemStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseQueue {
    /// Create a queue over an in-memory store.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryItemStore::new()))
    }

    /// Create a queue with a custom store.
    pub fn with_store(config: QueueConfig, store: Arc<dyn ItemStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open the store named by `config.db_path` (in-memory when unset).
    pub async fn open(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let store: Arc<dyn ItemStore> = match &config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            QueueError::StoreUnavailable(format!(
                                "Failed to create {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                Arc::new(SqliteItemStore::open(path).await?)
            }
            None => Arc::new(SqliteItemStore::in_memory().await?),
        };
        Ok(Self::with_store(config, store))
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a Pending item.
    pub async fn enqueue(
        &self,
        priority: i32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<ItemId, QueueError> {
        let item = NewItem::new(priority, payload);
        let size = item.payload.len();
        let id = self.store.insert(item, self.clock.now()).await?;
        debug!("Enqueued item {} (priority: {}, {} bytes)", id, priority, size);
        Ok(id)
    }

    /// Claim the next eligible item with the configured lease duration.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueueItem>, QueueError> {
        self.claim_with_lease(worker_id, self.config.lease()).await
    }

    /// Claim the next eligible item for `worker_id`, leasing it for `lease`.
    ///
    /// Candidates are tried in claim order with a compare-and-swap each. A lost
    /// swap means another caller took the item, so the next candidate is tried,
    /// and the candidate set is re-read once a batch is exhausted. Returns
    /// `None` only when nothing is eligible.
    pub async fn claim_with_lease(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, QueueError> {
        if worker_id.trim().is_empty() {
            return Err(QueueError::InvalidArgument("worker id must not be empty".to_string()));
        }
        if lease.is_zero() {
            return Err(QueueError::InvalidArgument("lease must be positive".to_string()));
        }
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| QueueError::InvalidArgument(format!("lease out of range: {}", e)))?;

        let mut lost = 0usize;
        loop {
            let now = self.clock.now();
            let candidates = self.store.eligible(now, self.config.claim_batch).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let expires_at = now.checked_add_signed(lease).ok_or_else(|| {
                QueueError::InvalidArgument(format!(
                    "lease of {}s runs past the representable time range",
                    lease.num_seconds()
                ))
            })?;
            let grant = Lease::new(worker_id, expires_at);
            for candidate in &candidates {
                if let Some(item) = self.store.conditional_claim(candidate, &grant, now).await? {
                    if candidate.status == ItemStatus::Processing {
                        info!(
                            "Reclaimed item {} from expired lease of {:?}",
                            item.id, candidate.locked_by
                        );
                    }
                    if !item.is_held_by(worker_id) {
                        let err = QueueError::InvariantViolation(format!(
                            "item {} claimed by {} but leased to {:?}",
                            item.id, worker_id, item.locked_by
                        ));
                        error!("{}", err);
                        return Err(err);
                    }
                    debug!(
                        "Worker {} claimed item {} (retry_count: {}, lost races: {})",
                        worker_id, item.id, item.retry_count, lost
                    );
                    return Ok(Some(item));
                }
                lost += 1;
            }
            debug!("Worker {} lost every candidate in a batch, re-reading", worker_id);
        }
    }

    /// Report success for a claimed item.
    pub async fn complete(&self, id: ItemId, worker_id: &str) -> Result<ReportOutcome, QueueError> {
        let transition = Transition::Complete {
            worker_id: worker_id.to_string(),
        };
        let outcome = self.store.update_status(id, &transition, self.clock.now()).await?;
        self.log_report(id, worker_id, &outcome);
        Ok(outcome)
    }

    /// Report failure using the configured retry limit.
    pub async fn fail(
        &self,
        id: ItemId,
        worker_id: &str,
        error: &str,
    ) -> Result<ReportOutcome, QueueError> {
        self.fail_with_policy(id, worker_id, error, self.config.retry_policy()).await
    }

    /// Report failure. The item returns to Pending unless its new retry count
    /// reaches the policy limit, in which case it is permanently Failed.
    pub async fn fail_with_policy(
        &self,
        id: ItemId,
        worker_id: &str,
        error: &str,
        policy: RetryPolicy,
    ) -> Result<ReportOutcome, QueueError> {
        let transition = Transition::Fail {
            worker_id: worker_id.to_string(),
            error: error.to_string(),
            policy,
        };
        let outcome = self.store.update_status(id, &transition, self.clock.now()).await?;
        self.log_report(id, worker_id, &outcome);
        Ok(outcome)
    }

    fn log_report(&self, id: ItemId, worker_id: &str, outcome: &ReportOutcome) {
        match outcome {
            ReportOutcome::Completed => debug!("Worker {} completed item {}", worker_id, id),
            ReportOutcome::Requeued { retry_count } => {
                debug!("Item {} requeued (attempt {})", id, retry_count)
            }
            ReportOutcome::Failed { retry_count } => {
                info!("Item {} failed permanently after {} attempts", id, retry_count)
            }
            ReportOutcome::Ignored(reason @ IgnoreReason::LeaseHeldBy { .. }) => {
                warn!("Ignoring late report from {} on item {}: {}", worker_id, id, reason)
            }
            ReportOutcome::Ignored(reason) => {
                debug!("Ignoring report from {} on item {}: {}", worker_id, id, reason)
            }
        }
    }

    /// Item counts per status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.aggregate_by_status().await
    }

    /// Delete Completed items processed more than `retention_days` ago.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64, QueueError> {
        // A window reaching before the calendar starts means nothing is old enough.
        let cutoff = chrono::Duration::try_days(i64::from(retention_days))
            .and_then(|window| self.clock.now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.store.delete_completed_before(cutoff).await?;
        if deleted > 0 {
            info!("Cleanup removed {} completed items older than {} days", deleted, retention_days);
        }
        Ok(deleted)
    }

    /// Load an item.
    pub async fn get(&self, id: ItemId) -> Result<QueueItem, QueueError> {
        self.store.get(id).await?.ok_or(QueueError::ItemNotFound(id))
    }

    /// Permanently failed items, kept for inspection.
    pub async fn failed_items(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        self.store.list_by_status(ItemStatus::Failed, limit).await
    }
}
