//! In-memory item store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::item::{
    claim_order, IgnoreReason, ItemId, ItemStatus, Lease, NewItem, QueueItem, ReportOutcome,
};

use super::{ItemStore, QueueStats, Transition};

struct Inner {
    items: BTreeMap<ItemId, QueueItem>,
    next_id: ItemId,
}

/// In-memory item store for tests and ephemeral queues.
///
/// All mutation happens under one write lock, so the compare-and-swap in
/// [`ItemStore::conditional_claim`] is trivially atomic.
pub struct MemoryItemStore {
    inner: RwLock<Inner>,
}

impl MemoryItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }
}

impl Default for MemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn insert(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemId, QueueError> {
        let mut inner = self.inner.write().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(id, QueueItem::pending(id, item, now));
        Ok(id)
    }

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueError> {
        let inner = self.inner.read().await;
        Ok(inner.items.get(&id).cloned())
    }

    async fn eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let inner = self.inner.read().await;
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|item| item.is_claimable_at(now))
            .cloned()
            .collect();
        items.sort_by(claim_order);
        items.truncate(limit);
        Ok(items)
    }

    async fn conditional_claim(
        &self,
        candidate: &QueueItem,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        let mut inner = self.inner.write().await;
        let Some(item) = inner.items.get_mut(&candidate.id) else {
            return Ok(None);
        };

        if item.status != candidate.status
            || item.locked_until != candidate.locked_until
            || !item.is_claimable_at(now)
        {
            return Ok(None);
        }

        item.status = ItemStatus::Processing;
        item.locked_by = Some(lease.holder.clone());
        item.locked_until = Some(lease.expires_at);
        Ok(Some(item.clone()))
    }

    async fn update_status(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, QueueError> {
        let mut inner = self.inner.write().await;
        let item = inner.items.get_mut(&id);

        if let Some(reason) = IgnoreReason::for_report(item.as_deref(), transition.worker_id()) {
            return Ok(ReportOutcome::Ignored(reason));
        }
        let Some(item) = item else {
            return Ok(ReportOutcome::Ignored(IgnoreReason::NotFound));
        };

        item.locked_by = None;
        item.locked_until = None;

        let outcome = match transition {
            Transition::Complete { .. } => {
                item.status = ItemStatus::Completed;
                item.processed_at = Some(now);
                ReportOutcome::Completed
            }
            Transition::Fail { error, policy, .. } => {
                item.retry_count += 1;
                item.last_error = Some(error.clone());
                item.status = policy.status_after_failure(item.retry_count);
                if item.status == ItemStatus::Failed {
                    ReportOutcome::Failed {
                        retry_count: item.retry_count,
                    }
                } else {
                    ReportOutcome::Requeued {
                        retry_count: item.retry_count,
                    }
                }
            }
        };
        Ok(outcome)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut inner = self.inner.write().await;
        let before = inner.items.len();
        inner.items.retain(|_, item| {
            !(item.status == ItemStatus::Completed
                && item.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.items.len()) as u64)
    }

    async fn aggregate_by_status(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.read().await;
        let mut stats = QueueStats::default();
        for item in inner.items.values() {
            stats.record(item.status, 1);
        }
        Ok(stats)
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let inner = self.inner.read().await;
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        items.sort_by(claim_order);
        items.truncate(limit);
        Ok(items)
    }
}
