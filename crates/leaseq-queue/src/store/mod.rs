//! Item persistence.
//!
//! Every store implements the same contract: insert, candidate selection,
//! a compare-and-swap claim, fenced status transitions, retention deletes,
//! and a per-status aggregate. The claim protocol itself lives in
//! [`crate::queue`] and only relies on this contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::item::{ItemId, ItemStatus, Lease, NewItem, QueueItem, ReportOutcome};
use crate::retry::RetryPolicy;

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryItemStore;
pub use sqlite::SqliteItemStore;

/// A worker report against a leased item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Processing -> Completed.
    Complete { worker_id: String },
    /// Processing -> Pending or Failed, decided by `policy`.
    Fail {
        worker_id: String,
        error: String,
        policy: RetryPolicy,
    },
}

impl Transition {
    /// Identity of the reporting worker.
    pub fn worker_id(&self) -> &str {
        match self {
            Transition::Complete { worker_id } | Transition::Fail { worker_id, .. } => worker_id,
        }
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueStats {
    /// Add `count` items of `status`.
    pub fn record(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::Processing => self.processing += count,
            ItemStatus::Completed => self.completed += count,
            ItemStatus::Failed => self.failed += count,
        }
        self.total += count;
    }

    /// Count for one status.
    pub fn count(&self, status: ItemStatus) -> u64 {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::Processing => self.processing,
            ItemStatus::Completed => self.completed,
            ItemStatus::Failed => self.failed,
        }
    }
}

/// Durable item store.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert a Pending item and return its new id.
    async fn insert(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemId, QueueError>;

    /// Load an item by id.
    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueError>;

    /// Up to `limit` items claimable at `now`, in claim order.
    async fn eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError>;

    /// Lease `candidate` to `lease.holder` if it is still exactly as observed
    /// (same status and lease expiry) and still claimable at `now`.
    ///
    /// Returns `None` when another caller got there first.
    async fn conditional_claim(
        &self,
        candidate: &QueueItem,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError>;

    /// Apply a worker report. Only the current lease holder may move the item.
    async fn update_status(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, QueueError>;

    /// Delete Completed items processed strictly before `cutoff`.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Point-in-time counts per status.
    async fn aggregate_by_status(&self) -> Result<QueueStats, QueueError>;

    /// Up to `limit` items with `status`, in claim order.
    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError>;
}
