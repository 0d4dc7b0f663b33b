use super::*;
use crate::clock::ManualClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
}

/// One queue per store backend, sharing a manual clock each.
async fn queues() -> Vec<(&'static str, LeaseQueue, Arc<ManualClock>)> {
    let mut out = Vec::new();

    let clock = Arc::new(ManualClock::new(start()));
    let memory = LeaseQueue::new(QueueConfig::default()).with_clock(clock.clone());
    out.push(("memory", memory, clock));

    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(SqliteItemStore::in_memory().await.unwrap());
    let sqlite = LeaseQueue::with_store(QueueConfig::default(), store).with_clock(clock.clone());
    out.push(("sqlite", sqlite, clock));

    out
}

fn assert_lease_invariant(item: &QueueItem) {
    assert_eq!(
        item.locked_by.is_some(),
        item.status == ItemStatus::Processing,
        "item {} ({}) lease holder mismatch",
        item.id,
        item.status
    );
    item.check_invariants().unwrap();
}

#[tokio::test]
async fn test_enqueue_claim_complete() {
    for (name, queue, _) in queues().await {
        let id = queue.enqueue(0, "payload").await.unwrap();

        let item = queue.claim("w1").await.unwrap().expect(name);
        assert_eq!(item.id, id);
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.locked_by.as_deref(), Some("w1"));
        assert_eq!(item.locked_until, Some(start() + chrono::Duration::seconds(300)));
        assert_eq!(item.payload, b"payload".to_vec());

        assert_eq!(queue.complete(id, "w1").await.unwrap(), ReportOutcome::Completed);
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.processed_at, Some(start()));
        assert!(queue.claim("w1").await.unwrap().is_none(), "{}", name);
    }
}

#[tokio::test]
async fn test_claim_empty_queue() {
    for (name, queue, _) in queues().await {
        assert!(queue.claim("w1").await.unwrap().is_none(), "{}", name);
    }
}

#[tokio::test]
async fn test_priority_then_age_ordering() {
    for (name, queue, clock) in queues().await {
        let mut ids = Vec::new();
        for priority in [5, 1, 5, 3] {
            ids.push(queue.enqueue(priority, format!("p{}", priority)).await.unwrap());
            clock.advance(chrono::Duration::milliseconds(10));
        }

        let first = queue.claim("w1").await.unwrap().unwrap();
        let second = queue.claim("w1").await.unwrap().unwrap();
        let third = queue.claim("w1").await.unwrap().unwrap();

        assert_eq!(first.id, ids[0], "{}", name);
        assert_eq!(second.id, ids[2], "{}", name);
        assert_eq!(third.id, ids[3], "{}", name);
        assert_eq!(
            [first.priority, second.priority, third.priority],
            [5, 5, 3],
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_same_timestamp_keeps_insertion_order() {
    for (name, queue, _) in queues().await {
        let a = queue.enqueue(1, "a").await.unwrap();
        let b = queue.enqueue(1, "b").await.unwrap();
        assert_eq!(queue.claim("w1").await.unwrap().unwrap().id, a, "{}", name);
        assert_eq!(queue.claim("w1").await.unwrap().unwrap().id, b, "{}", name);
    }
}

#[tokio::test]
async fn test_retry_threshold() {
    for (name, queue, _) in queues().await {
        let id = queue.enqueue(0, "flaky").await.unwrap();

        let item = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 0);
        let outcome = queue.fail(id, "w1", "error 1").await.unwrap();
        assert_eq!(outcome, ReportOutcome::Requeued { retry_count: 1 }, "{}", name);
        assert_eq!(queue.get(id).await.unwrap().status, ItemStatus::Pending);

        let item = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        let outcome = queue.fail(id, "w1", "error 2").await.unwrap();
        assert_eq!(outcome, ReportOutcome::Requeued { retry_count: 2 }, "{}", name);

        let item = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
        let outcome = queue.fail(id, "w1", "error 3").await.unwrap();
        assert_eq!(outcome, ReportOutcome::Failed { retry_count: 3 }, "{}", name);
        assert_eq!(outcome.retry_count(), Some(3));

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_deref(), Some("error 3"));
        assert!(item.processed_at.is_none());
        assert!(queue.claim("w1").await.unwrap().is_none(), "failed is terminal");
    }
}

#[tokio::test]
async fn test_custom_retry_policy() {
    for (name, queue, _) in queues().await {
        let id = queue.enqueue(0, "once").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        let outcome = queue
            .fail_with_policy(id, "w1", "fatal", RetryPolicy::new(1))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Failed { retry_count: 1 }, "{}", name);
    }
}

#[tokio::test]
async fn test_lease_reclaim_after_expiry() {
    for (name, queue, clock) in queues().await {
        let id = queue.enqueue(0, "slow").await.unwrap();
        let lease = Duration::from_secs(1);

        queue.claim_with_lease("w1", lease).await.unwrap().unwrap();
        assert!(queue.claim_with_lease("w2", lease).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(1));
        assert!(
            queue.claim_with_lease("w2", lease).await.unwrap().is_none(),
            "{}: lease still valid at its expiry instant",
            name
        );

        clock.advance(chrono::Duration::milliseconds(1));
        let item = queue.claim_with_lease("w2", lease).await.unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.locked_by.as_deref(), Some("w2"));
        assert_eq!(item.retry_count, 0, "reclaim is not a failure");

        clock.advance(chrono::Duration::milliseconds(1001));
        let again = queue.claim_with_lease("w2", lease).await.unwrap().unwrap();
        assert_eq!(again.id, id, "{}: same worker may reclaim", name);
    }
}

#[tokio::test]
async fn test_late_report_after_reclaim_is_ignored() {
    for (name, queue, clock) in queues().await {
        let id = queue.enqueue(0, "contested").await.unwrap();
        queue.claim_with_lease("w1", Duration::from_secs(1)).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(2));
        queue.claim("w2").await.unwrap().unwrap();

        let outcome = queue.complete(id, "w1").await.unwrap();
        assert_eq!(
            outcome,
            ReportOutcome::Ignored(IgnoreReason::LeaseHeldBy {
                holder: "w2".to_string()
            }),
            "{}",
            name
        );
        let outcome = queue.fail(id, "w1", "late").await.unwrap();
        assert!(!outcome.is_applied());

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Processing);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.locked_by.as_deref(), Some("w2"));

        assert_eq!(queue.complete(id, "w2").await.unwrap(), ReportOutcome::Completed);
    }
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    for (name, queue, clock) in queues().await {
        let id = queue.enqueue(0, "once").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        assert_eq!(queue.complete(id, "w1").await.unwrap(), ReportOutcome::Completed);
        let after_first = queue.get(id).await.unwrap();
        let stats_first = queue.stats().await.unwrap();

        clock.advance(chrono::Duration::seconds(30));
        let outcome = queue.complete(id, "w1").await.unwrap();
        assert!(!outcome.is_applied(), "{}", name);
        assert_eq!(queue.get(id).await.unwrap(), after_first);
        assert_eq!(queue.stats().await.unwrap(), stats_first);
    }
}

#[tokio::test]
async fn test_reports_on_unknown_id_are_noops() {
    for (name, queue, _) in queues().await {
        assert_eq!(
            queue.complete(12345, "w1").await.unwrap(),
            ReportOutcome::Ignored(IgnoreReason::NotFound),
            "{}",
            name
        );
        assert_eq!(
            queue.fail(12345, "w1", "x").await.unwrap(),
            ReportOutcome::Ignored(IgnoreReason::NotFound)
        );
        assert!(matches!(
            queue.get(12345).await,
            Err(QueueError::ItemNotFound(12345))
        ));
    }
}

#[tokio::test]
async fn test_retention() {
    for (name, queue, clock) in queues().await {
        let old = queue.enqueue(0, "old").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.complete(old, "w1").await.unwrap();

        clock.advance(chrono::Duration::days(7));
        let recent = queue.enqueue(0, "recent").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.complete(recent, "w1").await.unwrap();

        let failed = queue.enqueue(0, "failed").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.fail_with_policy(failed, "w1", "x", RetryPolicy::new(1)).await.unwrap();
        let pending = queue.enqueue(0, "pending").await.unwrap();

        // old was processed 10 days ago, recent 3 days ago.
        clock.advance(chrono::Duration::days(3));
        let deleted = queue.cleanup(7).await.unwrap();
        assert_eq!(deleted, 1, "{}", name);
        assert!(matches!(queue.get(old).await, Err(QueueError::ItemNotFound(_))));
        assert!(queue.get(recent).await.is_ok());
        assert!(queue.get(failed).await.is_ok());
        assert!(queue.get(pending).await.is_ok());

        clock.advance(chrono::Duration::days(365));
        assert_eq!(queue.cleanup(7).await.unwrap(), 1, "only recent goes");
        assert!(queue.get(failed).await.is_ok());
        assert!(queue.get(pending).await.is_ok());
    }
}

#[tokio::test]
async fn test_stats() {
    for (name, queue, _) in queues().await {
        for i in 0..4 {
            queue.enqueue(i, "x").await.unwrap();
        }
        let a = queue.claim("w1").await.unwrap().unwrap();
        queue.complete(a.id, "w1").await.unwrap();
        let b = queue.claim("w1").await.unwrap().unwrap();
        queue.fail_with_policy(b.id, "w1", "x", RetryPolicy::new(1)).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 1,
                total: 4,
            },
            "{}",
            name
        );
    }
}

#[tokio::test]
async fn test_failed_items_listing() {
    for (name, queue, _) in queues().await {
        let id = queue.enqueue(0, "doomed").await.unwrap();
        queue.enqueue(0, "fine").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.fail_with_policy(id, "w1", "bad input", RetryPolicy::new(1)).await.unwrap();

        let failed = queue.failed_items(10).await.unwrap();
        assert_eq!(failed.len(), 1, "{}", name);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].last_error.as_deref(), Some("bad input"));
    }
}

#[tokio::test]
async fn test_invalid_claim_arguments() {
    let queue = LeaseQueue::new(QueueConfig::default());
    queue.enqueue(0, "x").await.unwrap();

    assert!(matches!(
        queue.claim("  ").await,
        Err(QueueError::InvalidArgument(_))
    ));
    assert!(matches!(
        queue.claim_with_lease("w1", Duration::ZERO).await,
        Err(QueueError::InvalidArgument(_))
    ));
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_invariants_hold_after_mixed_operations() {
    for (_, queue, clock) in queues().await {
        let mut ids = Vec::new();
        for i in 0..12 {
            ids.push(queue.enqueue(i % 3, format!("item-{}", i)).await.unwrap());
        }

        for round in 0..20u32 {
            let worker = format!("w{}", round % 3);
            let lease = Duration::from_secs(u64::from(round % 4) + 1);
            if let Some(item) = queue.claim_with_lease(&worker, lease).await.unwrap() {
                match round % 4 {
                    0 => {
                        queue.complete(item.id, &worker).await.unwrap();
                    }
                    1 | 2 => {
                        queue.fail(item.id, &worker, "flaky").await.unwrap();
                    }
                    _ => {}
                }
            }
            // A stranger's late report must never disturb anything.
            queue.complete(ids[(round as usize) % ids.len()], "stranger").await.unwrap();
            clock.advance(chrono::Duration::milliseconds(700));
        }

        let mut total = 0;
        for id in &ids {
            let item = queue.get(*id).await.unwrap();
            assert_lease_invariant(&item);
            assert!(item.retry_count <= 3);
            if item.status == ItemStatus::Failed {
                assert!(item.retry_count >= 3);
            }
            total += 1;
        }
        assert_eq!(queue.stats().await.unwrap().total, total);
    }
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let queue = Arc::new(LeaseQueue::new(QueueConfig {
        claim_batch: 4,
        ..Default::default()
    }));
    for i in 0..200 {
        queue.enqueue(i % 7, format!("item-{}", i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{}", n);
            let mut claimed = Vec::new();
            while let Some(item) = queue.claim(&worker).await.unwrap() {
                claimed.push(item.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(queue.stats().await.unwrap().processing, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claims_across_connections_are_exclusive() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("queue.db");
    let config = QueueConfig {
        claim_batch: 2,
        ..Default::default()
    };

    let first = Arc::new(LeaseQueue::with_store(
        config.clone(),
        Arc::new(SqliteItemStore::open(&path).await.unwrap()),
    ));
    let second = Arc::new(LeaseQueue::with_store(
        config,
        Arc::new(SqliteItemStore::open(&path).await.unwrap()),
    ));
    for i in 0..200 {
        first.enqueue(i % 5, format!("item-{}", i)).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let queue = if n % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            let worker = format!("w{}", n);
            let mut claimed = Vec::new();
            while let Some(item) = queue.claim(&worker).await.unwrap() {
                assert!(item.is_held_by(&worker));
                claimed.push(item.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(second.stats().await.unwrap().processing, 200);
}

/// Store where a rival worker takes the first candidate just before our swap.
struct RivalStore {
    inner: MemoryItemStore,
    reads: AtomicUsize,
    steals: AtomicUsize,
}

impl RivalStore {
    fn new() -> Self {
        Self {
            inner: MemoryItemStore::new(),
            reads: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ItemStore for RivalStore {
    async fn insert(&self, item: NewItem, now: DateTime<Utc>) -> Result<ItemId, QueueError> {
        self.inner.insert(item, now).await
    }

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueError> {
        self.inner.get(id).await
    }

    async fn eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.eligible(now, limit).await
    }

    async fn conditional_claim(
        &self,
        candidate: &QueueItem,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, QueueError> {
        if self.steals.fetch_add(1, Ordering::SeqCst) == 0 {
            let rival = Lease::new("rival", lease.expires_at);
            assert!(self.inner.conditional_claim(candidate, &rival, now).await?.is_some());
        }
        self.inner.conditional_claim(candidate, lease, now).await
    }

    async fn update_status(
        &self,
        id: ItemId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, QueueError> {
        self.inner.update_status(id, transition, now).await
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        self.inner.delete_completed_before(cutoff).await
    }

    async fn aggregate_by_status(&self) -> Result<QueueStats, QueueError> {
        self.inner.aggregate_by_status().await
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.inner.list_by_status(status, limit).await
    }
}

#[tokio::test]
async fn test_lost_race_moves_to_next_candidate() {
    // (claim batch, expected candidate reads)
    for (batch, reads) in [(4, 1), (1, 2)] {
        let store = Arc::new(RivalStore::new());
        let config = QueueConfig {
            claim_batch: batch,
            ..Default::default()
        };
        let queue = LeaseQueue::with_store(config, store.clone());
        let first = queue.enqueue(5, "first").await.unwrap();
        let second = queue.enqueue(1, "second").await.unwrap();

        let item = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(item.id, second, "batch {}", batch);
        assert!(item.is_held_by("w1"));
        assert_eq!(store.reads.load(Ordering::SeqCst), reads, "batch {}", batch);

        let taken = queue.get(first).await.unwrap();
        assert!(taken.is_held_by("rival"));
        assert_lease_invariant(&taken);
    }
}

#[tokio::test]
async fn test_cleanup_with_huge_retention_deletes_nothing() {
    for (name, queue, clock) in queues().await {
        let id = queue.enqueue(0, "done").await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.complete(id, "w1").await.unwrap();
        clock.advance(chrono::Duration::days(365));

        assert_eq!(queue.cleanup(u32::MAX).await.unwrap(), 0, "{}", name);
        assert_eq!(queue.get(id).await.unwrap().status, ItemStatus::Completed);
        assert_eq!(queue.cleanup(0).await.unwrap(), 1, "{}", name);
    }
}

#[tokio::test]
async fn test_claim_rejects_lease_past_time_range() {
    for (name, queue, _) in queues().await {
        queue.enqueue(0, "x").await.unwrap();

        let result = queue
            .claim_with_lease("w1", Duration::from_secs(1_000_000_000_000_000))
            .await;
        assert!(matches!(result, Err(QueueError::InvalidArgument(_))), "{}", name);
        assert_eq!(queue.stats().await.unwrap().pending, 1, "{}", name);
    }
}

#[tokio::test]
async fn test_open_sqlite_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = QueueConfig {
        db_path: Some(temp_dir.path().join("nested").join("queue.db")),
        ..Default::default()
    };

    let id = {
        let queue = LeaseQueue::open(config.clone()).await.unwrap();
        queue.enqueue(1, "persisted").await.unwrap()
    };

    let queue = LeaseQueue::open(config).await.unwrap();
    let item = queue.claim("w1").await.unwrap().unwrap();
    assert_eq!(item.id, id);
    assert_eq!(item.payload_lossy(), "persisted");
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let config = QueueConfig {
        lease_secs: 0,
        ..Default::default()
    };
    assert!(matches!(
        LeaseQueue::open(config).await,
        Err(QueueError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_real_time_lease_expiry() {
    let queue = LeaseQueue::open(QueueConfig::default()).await.unwrap();
    let id = queue.enqueue(0, "abandoned").await.unwrap();

    queue.claim_with_lease("w1", Duration::from_secs(1)).await.unwrap().unwrap();
    assert!(queue.claim("w2").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let item = queue.claim("w2").await.unwrap().unwrap();
    assert_eq!(item.id, id);
}
