//! # Leaseq Queue
//!
//! Persistent, priority-ordered job queue for concurrent workers.
//!
//! ## Features
//!
//! - Priority ordering (higher first, oldest first among equals)
//! - Atomic claim with time-bounded leases
//! - Stale lease reclaim
//! - Bounded retries with a terminal failed state
//! - Retention cleanup of completed items
//! - In-memory and SQLite stores
//! - Worker pool driving a pluggable item handler

pub mod clock;
pub mod config;
pub mod error;
pub mod item;
pub mod queue;
pub mod retry;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::QueueError;
pub use item::{IgnoreReason, ItemId, ItemStatus, Lease, NewItem, QueueItem, ReportOutcome};
pub use queue::LeaseQueue;
pub use retry::RetryPolicy;
pub use store::{ItemStore, MemoryItemStore, QueueStats, SqliteItemStore, Transition};
pub use worker::{ItemHandler, Worker, WorkerPool};
