//! Retry policy for failure reports.

use crate::item::ItemStatus;

/// Decides where an item goes after a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    /// Create a policy that fails an item permanently once its retry count
    /// reaches `max_retries`.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Failure reports allowed before the item becomes terminal.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Status after a failure that brought the retry count to `new_retry_count`.
    pub fn status_after_failure(&self, new_retry_count: u32) -> ItemStatus {
        if new_retry_count >= self.max_retries {
            ItemStatus::Failed
        } else {
            ItemStatus::Pending
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
