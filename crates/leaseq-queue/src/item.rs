//! Queue item definition and status.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Store-assigned item identifier. Monotonic, never reused.
pub type ItemId = i64;

/// Item status.
///
/// The discriminants are the persisted representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending = 0,
    /// Leased to a worker.
    Processing = 1,
    /// Finished successfully. Terminal.
    Completed = 2,
    /// Retries exhausted. Terminal.
    Failed = 3,
}

impl ItemStatus {
    /// All statuses, in persisted order.
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
    ];

    /// Persisted integer code.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Decode a persisted integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ItemStatus::Pending),
            1 => Some(ItemStatus::Processing),
            2 => Some(ItemStatus::Completed),
            3 => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    /// Completed and Failed admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-bounded ownership grant over one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker identity holding the lease.
    pub holder: String,
    /// Instant after which the item may be reclaimed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease.
    pub fn new(holder: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            expires_at,
        }
    }

    /// Whether the lease has run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Producer-side input for a new item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    /// Higher sorts first.
    pub priority: i32,
    /// Opaque caller-defined payload.
    pub payload: Vec<u8>,
}

impl NewItem {
    /// Create a new item.
    pub fn new(priority: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            priority,
            payload: payload.into(),
        }
    }
}

/// An item in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item ID.
    pub id: ItemId,
    /// Higher sorts first.
    pub priority: i32,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Completion time, set only on Completed.
    pub processed_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ItemStatus,
    /// Failure reports received so far.
    pub retry_count: u32,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Lease holder while Processing.
    pub locked_by: Option<String>,
    /// Lease expiry while Processing.
    pub locked_until: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Build a freshly enqueued item.
    pub fn pending(id: ItemId, new: NewItem, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            priority: new.priority,
            payload: new.payload,
            created_at,
            processed_at: None,
            status: ItemStatus::Pending,
            retry_count: 0,
            last_error: None,
            locked_by: None,
            locked_until: None,
        }
    }

    /// Current lease, if any.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.locked_by, self.locked_until) {
            (Some(holder), Some(expires_at)) => Some(Lease::new(holder.clone(), expires_at)),
            _ => None,
        }
    }

    /// Eligible for claim: Pending, or Processing with an expired lease.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ItemStatus::Pending => true,
            ItemStatus::Processing => self.locked_until.is_some_and(|until| until < now),
            ItemStatus::Completed | ItemStatus::Failed => false,
        }
    }

    /// Whether `worker_id` currently holds the lease.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == ItemStatus::Processing && self.locked_by.as_deref() == Some(worker_id)
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Check the lease/status invariants.
    pub fn check_invariants(&self) -> Result<(), QueueError> {
        let violation = |msg: &str| {
            Err(QueueError::InvariantViolation(format!(
                "item {} ({}): {}",
                self.id, self.status, msg
            )))
        };

        if self.locked_by.is_some() != self.locked_until.is_some() {
            return violation("lease holder and expiry must be set together");
        }
        if (self.status == ItemStatus::Processing) != self.locked_by.is_some() {
            return violation("lease must be held exactly while processing");
        }
        if (self.status == ItemStatus::Completed) != self.processed_at.is_some() {
            return violation("processed_at must be set exactly when completed");
        }
        Ok(())
    }
}

/// Claim order: priority descending, then oldest first, then lowest id.
pub fn claim_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Why a completion or failure report was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum IgnoreReason {
    /// No item with that id.
    NotFound,
    /// Item is not leased (terminal or back to pending).
    NotProcessing { status: ItemStatus },
    /// Item is leased to a different worker.
    LeaseHeldBy { holder: String },
    /// A concurrent update changed the item between the report and the re-read.
    Superseded,
}

impl IgnoreReason {
    /// Explain why a report from `worker_id` cannot apply to `item`.
    ///
    /// Returns `None` when the report would apply.
    pub fn for_report(item: Option<&QueueItem>, worker_id: &str) -> Option<Self> {
        let item = match item {
            Some(item) => item,
            None => return Some(IgnoreReason::NotFound),
        };
        if item.status != ItemStatus::Processing {
            return Some(IgnoreReason::NotProcessing { status: item.status });
        }
        match item.locked_by.as_deref() {
            Some(holder) if holder == worker_id => None,
            Some(holder) => Some(IgnoreReason::LeaseHeldBy {
                holder: holder.to_string(),
            }),
            None => Some(IgnoreReason::NotProcessing { status: item.status }),
        }
    }

    /// Explain a report that a conditional update refused.
    ///
    /// If the re-read item would now accept the report, it changed under a
    /// concurrent writer and the report is `Superseded`.
    pub fn for_refused_report(item: Option<&QueueItem>, worker_id: &str) -> Self {
        Self::for_report(item, worker_id).unwrap_or(IgnoreReason::Superseded)
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::NotFound => write!(f, "item not found"),
            IgnoreReason::NotProcessing { status } => write!(f, "item is {}", status),
            IgnoreReason::LeaseHeldBy { holder } => write!(f, "lease held by {}", holder),
            IgnoreReason::Superseded => write!(f, "item changed by a concurrent update"),
        }
    }
}

/// Result of a completion or failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReportOutcome {
    /// Item moved to Completed.
    Completed,
    /// Item returned to Pending.
    Requeued { retry_count: u32 },
    /// Item moved to Failed.
    Failed { retry_count: u32 },
    /// Report was a no-op.
    Ignored(IgnoreReason),
}

impl ReportOutcome {
    /// Retry count after a failure report that was applied.
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            ReportOutcome::Requeued { retry_count } | ReportOutcome::Failed { retry_count } => {
                Some(*retry_count)
            }
            ReportOutcome::Completed | ReportOutcome::Ignored(_) => None,
        }
    }

    /// Whether the report changed the item.
    pub fn is_applied(&self) -> bool {
        !matches!(self, ReportOutcome::Ignored(_))
    }
}
