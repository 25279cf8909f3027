//! Exclusive batch assignment of pending items to workers
//!
//! A claim walks the pending index in (priority, scheduled_at) order and
//! `try_lock`s each candidate. Items another claimer or reporter currently
//! holds are skipped rather than waited on, so claimers never block each
//! other; a skipped item is offered again on the next poll. Every selected
//! item stays locked until the whole batch has been journaled and committed,
//! which makes concurrent batches disjoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::item::{QueueItem, QueueStatus};
use super::store::EvaluationQueue;
use crate::error::{CoreError, Result};
use crate::storage::JournalEntry;

/// Outcome of one lease reclaim pass
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReclaimReport {
    /// Items handed back to the pending pool
    pub requeued: usize,
    /// Items that had no attempts left and were failed
    pub failed: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

pub struct WorkerLeaseManager {
    queue: Arc<EvaluationQueue>,
}

impl WorkerLeaseManager {
    pub fn new(queue: Arc<EvaluationQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<EvaluationQueue> {
        &self.queue
    }

    pub fn claim_batch(&self, batch_size: usize, worker_id: &str) -> Result<Vec<QueueItem>> {
        self.claim_batch_at(batch_size, worker_id, Utc::now())
    }

    /// Claim up to `batch_size` due items for `worker_id`.
    ///
    /// Returned items are ordered by priority, then scheduled time, and are
    /// already `processing` with their attempt counter incremented.
    pub fn claim_batch_at(
        &self,
        batch_size: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        if worker_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("worker id is required".into()));
        }
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        // Walk the pending index and lock up to `batch_size` claimable items
        let mut guards = Vec::with_capacity(batch_size);
        {
            let pending = self.queue.pending.read();
            for key in pending.iter() {
                if guards.len() >= batch_size {
                    break;
                }
                // Not yet due; a later key in another priority band may be
                if key.scheduled_at > now {
                    continue;
                }
                let Some(cell) = self.queue.cell(&key.id) else {
                    continue;
                };
                let Some(guard) = cell.try_lock_arc() else {
                    tracing::trace!(item_id = %key.id, "Skipping locked item");
                    continue;
                };
                if guard.is_claimable(now) {
                    guards.push(guard);
                }
            }
        }
        if guards.is_empty() {
            return Ok(Vec::new());
        }

        let lease_ttl = self.queue.config.chrono_lease_ttl();
        let claimed: Vec<QueueItem> = guards
            .iter()
            .map(|item| item.claimed_by(worker_id, now, lease_ttl))
            .collect();

        // Nothing is visible until the assignment is durable; on failure the
        // guards drop and every item stays pending.
        self.queue.write_ahead(|| JournalEntry::ClaimBatch {
            items: claimed.clone(),
        })?;

        {
            let mut pending = self.queue.pending.write();
            for guard in &guards {
                pending.remove(&guard.pending_key());
            }
        }
        for (guard, next) in guards.iter_mut().zip(&claimed) {
            **guard = next.clone();
        }
        drop(guards);

        tracing::info!(
            worker_id = %worker_id,
            claimed = claimed.len(),
            requested = batch_size,
            "Claimed evaluation batch"
        );

        Ok(claimed)
    }

    pub fn reclaim_expired(&self) -> Result<ReclaimReport> {
        self.reclaim_expired_at(Utc::now())
    }

    /// Return processing items whose lease has run out to the pending pool,
    /// or fail them when no attempts remain. Items locked by another
    /// operation are left for the next pass.
    pub fn reclaim_expired_at(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();

        for cell in self.queue.snapshot_cells() {
            let Some(mut item) = cell.try_lock() else {
                continue;
            };
            if !item.lease_expired(now) {
                continue;
            }

            let next = item.expire_lease(now);
            self.queue
                .write_ahead(|| JournalEntry::QueueItem { item: next.clone() })?;

            tracing::warn!(
                item_id = %next.id,
                worker_id = ?item.worker_id,
                attempts = next.attempts,
                status = next.status.as_str(),
                "Worker lease expired"
            );

            if next.status == QueueStatus::Pending {
                self.queue.pending.write().insert(next.pending_key());
                report.requeued += 1;
            } else {
                report.failed += 1;
            }
            *item = next;
        }

        if report.total() > 0 {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                "Reclaimed expired leases"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertId, ComparisonOp, InMemoryAlertRegistry, MetricKind};
    use crate::queue::{EnqueueOptions, EvaluationKind, Outcome, QueueConfig};
    use crate::storage::MemoryJournal;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn setup_with(config: QueueConfig) -> (WorkerLeaseManager, AlertId) {
        let registry = Arc::new(InMemoryAlertRegistry::new());
        let alert_id = registry
            .create(Alert::new(
                "ops",
                MetricKind::ResponseTime,
                ComparisonOp::GreaterThan,
                300.0,
            ))
            .unwrap();
        let queue = Arc::new(EvaluationQueue::new(registry, config));
        (WorkerLeaseManager::new(queue), alert_id)
    }

    fn setup() -> (WorkerLeaseManager, AlertId) {
        setup_with(QueueConfig::default())
    }

    #[test]
    fn test_enqueue_then_claim_one() {
        let (leases, alert_id) = setup();
        let id = leases
            .queue()
            .enqueue_with(
                alert_id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default().priority(5),
            )
            .unwrap();

        let batch = leases.claim_batch(1, "w1").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].attempts, 1);
        assert_eq!(batch[0].status, QueueStatus::Processing);
        assert_eq!(batch[0].worker_id.as_deref(), Some("w1"));

        assert!(leases.claim_batch(1, "w2").unwrap().is_empty());
    }

    #[test]
    fn test_claim_orders_by_priority_then_due_time() {
        let (leases, alert_id) = setup();
        let queue = leases.queue();
        let now = Utc::now();

        let low = queue
            .enqueue_at(
                alert_id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default().priority(9).scheduled_at(now - Duration::hours(1)),
                now,
            )
            .unwrap();
        let late = queue
            .enqueue_at(
                alert_id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default().priority(1).scheduled_at(now - Duration::minutes(1)),
                now,
            )
            .unwrap();
        let early = queue
            .enqueue_at(
                alert_id,
                EvaluationKind::Manual,
                EnqueueOptions::default().priority(1).scheduled_at(now - Duration::minutes(5)),
                now,
            )
            .unwrap();

        let batch = leases.claim_batch_at(10, "w1", now).unwrap();
        let ids: Vec<_> = batch.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![early, late, low]);
    }

    #[test]
    fn test_claim_skips_future_items() {
        let (leases, alert_id) = setup();
        let now = Utc::now();
        let future = leases
            .queue()
            .enqueue_at(
                alert_id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default().priority(0).scheduled_at(now + Duration::minutes(5)),
                now,
            )
            .unwrap();
        let due = leases
            .queue()
            .enqueue_at(alert_id, EvaluationKind::Scheduled, EnqueueOptions::default(), now)
            .unwrap();

        let batch = leases.claim_batch_at(10, "w1", now).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, due);

        let later = leases
            .claim_batch_at(10, "w1", now + Duration::minutes(5))
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, future);
    }

    #[test]
    fn test_claim_skips_locked_item() {
        let (leases, alert_id) = setup();
        let queue = leases.queue();
        let now = Utc::now();
        let held = queue
            .enqueue_at(
                alert_id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default().priority(1),
                now,
            )
            .unwrap();
        let free = queue
            .enqueue_at(alert_id, EvaluationKind::Scheduled, EnqueueOptions::default(), now)
            .unwrap();

        let cell = queue.cell(&held).unwrap();
        let guard = cell.lock();
        let batch = leases.claim_batch_at(2, "w1", now).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, free);
        drop(guard);

        let batch = leases.claim_batch_at(2, "w2", now).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, held);
    }

    #[test]
    fn test_transient_failure_is_reclaimable() {
        let (leases, alert_id) = setup();
        let queue = leases.queue();
        let id = queue.enqueue(alert_id, EvaluationKind::Scheduled).unwrap();

        leases.claim_batch(1, "w1").unwrap();
        let item = queue
            .report_outcome(
                id,
                "w1",
                Outcome::TransientFailure {
                    message: "timeout".into(),
                },
            )
            .unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 1);

        let batch = leases.claim_batch(1, "w2").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].attempts, 2);
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let (leases, alert_id) = setup_with(QueueConfig::default().with_max_attempts(2));
        let queue = leases.queue();
        let id = queue.enqueue(alert_id, EvaluationKind::Scheduled).unwrap();

        for round in 1..=2 {
            let batch = leases.claim_batch(1, "w1").unwrap();
            assert_eq!(batch[0].attempts, round);
            let _ = queue.report_outcome(
                id,
                "w1",
                Outcome::TransientFailure {
                    message: format!("attempt {}", round),
                },
            );
        }

        assert!(leases.claim_batch(1, "w1").unwrap().is_empty());
        let item = queue.get(&id).unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert_eq!(item.error_message.as_deref(), Some("attempt 2"));
    }

    #[test]
    fn test_claim_rejects_empty_worker() {
        let (leases, _) = setup();
        assert!(matches!(
            leases.claim_batch(1, " "),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_claim_journal_failure_keeps_items_pending() {
        let registry = Arc::new(InMemoryAlertRegistry::new());
        let alert_id = registry
            .create(Alert::new("ops", MetricKind::Uptime, ComparisonOp::LessThan, 99.0))
            .unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let queue = Arc::new(
            EvaluationQueue::new(registry, QueueConfig::default()).with_journal(journal.clone()),
        );
        let leases = WorkerLeaseManager::new(queue.clone());
        let id = queue.enqueue(alert_id, EvaluationKind::Scheduled).unwrap();

        journal.set_failing(true);
        assert!(matches!(
            leases.claim_batch(1, "w1"),
            Err(CoreError::StorageFailure(_))
        ));
        assert_eq!(queue.get(&id).unwrap().status, QueueStatus::Pending);

        journal.set_failing(false);
        assert_eq!(leases.claim_batch(1, "w1").unwrap().len(), 1);
        assert!(matches!(
            journal.entries().last(),
            Some(JournalEntry::ClaimBatch { items }) if items.len() == 1
        ));
    }

    #[test]
    fn test_reclaim_expired_lease() {
        let (leases, alert_id) = setup_with(
            QueueConfig::default()
                .with_max_attempts(2)
                .with_lease_ttl(Some(std::time::Duration::from_secs(60))),
        );
        let queue = leases.queue();
        let now = Utc::now();
        let id = queue
            .enqueue_at(alert_id, EvaluationKind::Scheduled, EnqueueOptions::default(), now)
            .unwrap();

        leases.claim_batch_at(1, "w1", now).unwrap();
        assert_eq!(leases.reclaim_expired_at(now + Duration::seconds(30)).unwrap().total(), 0);

        let report = leases.reclaim_expired_at(now + Duration::seconds(61)).unwrap();
        assert_eq!(report.requeued, 1);

        let stale = queue.report_outcome(
            id,
            "w1",
            Outcome::Success {
                result: serde_json::Value::Null,
            },
        );
        assert!(matches!(stale, Err(CoreError::InvalidTransition { .. })));

        let later = now + Duration::seconds(62);
        leases.claim_batch_at(1, "w2", later).unwrap();
        let report = leases
            .reclaim_expired_at(later + Duration::seconds(61))
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(queue.get(&id).unwrap().status, QueueStatus::Failed);
    }

    #[test]
    fn test_no_lease_ttl_never_reclaims() {
        let (leases, alert_id) = setup_with(QueueConfig::default().with_lease_ttl(None));
        leases.queue().enqueue(alert_id, EvaluationKind::Scheduled).unwrap();
        leases.claim_batch(1, "w1").unwrap();
        let report = leases
            .reclaim_expired_at(Utc::now() + Duration::days(365))
            .unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn test_huge_lease_ttl_still_claims() {
        let (leases, alert_id) = setup_with(
            QueueConfig::default()
                .with_lease_ttl(Some(std::time::Duration::from_secs(100_000_000_000_000))),
        );
        let id = leases
            .queue()
            .enqueue(alert_id, EvaluationKind::Scheduled)
            .unwrap();

        let batch = leases.claim_batch(1, "w1").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].lease_expires_at, None);

        let report = leases
            .reclaim_expired_at(Utc::now() + Duration::days(365))
            .unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn test_concurrent_claims_are_disjoint() {
        let (leases, alert_id) = setup();
        let leases = Arc::new(leases);
        for _ in 0..500 {
            leases.queue().enqueue(alert_id, EvaluationKind::Scheduled).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let leases = Arc::clone(&leases);
                std::thread::spawn(move || {
                    let worker = format!("w{}", w);
                    let mut mine = Vec::new();
                    loop {
                        let batch = leases.claim_batch(7, &worker).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        for item in &batch {
                            assert_eq!(item.worker_id.as_deref(), Some(worker.as_str()));
                        }
                        mine.extend(batch.into_iter().map(|i| i.id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "item {} claimed twice", id);
            }
        }
        assert_eq!(total, 500);
        assert_eq!(leases.queue().counts().processing, 500);
    }

    proptest! {
        #[test]
        fn prop_batch_is_sorted_and_due(
            specs in proptest::collection::vec((0i32..4, -120i64..120), 1..40),
            batch_size in 1usize..50,
        ) {
            let (leases, alert_id) = setup();
            let now = Utc::now();
            for (priority, offset) in &specs {
                leases.queue().enqueue_at(
                    alert_id,
                    EvaluationKind::Scheduled,
                    EnqueueOptions::default()
                        .priority(*priority)
                        .scheduled_at(now + Duration::seconds(*offset)),
                    now,
                ).unwrap();
            }

            let batch = leases.claim_batch_at(batch_size, "w1", now).unwrap();
            let due = specs.iter().filter(|(_, offset)| *offset <= 0).count();
            prop_assert_eq!(batch.len(), due.min(batch_size));

            for item in &batch {
                prop_assert!(item.scheduled_at <= now);
                prop_assert_eq!(item.attempts, 1);
            }
            for pair in batch.windows(2) {
                prop_assert!(
                    (pair[0].priority, pair[0].scheduled_at) <= (pair[1].priority, pair[1].scheduled_at)
                );
            }
        }

        #[test]
        fn prop_sequential_claims_are_disjoint(
            count in 1usize..60,
            sizes in proptest::collection::vec(1usize..10, 1..20),
        ) {
            let (leases, alert_id) = setup();
            for _ in 0..count {
                leases.queue().enqueue(alert_id, EvaluationKind::Scheduled).unwrap();
            }

            let mut seen = HashSet::new();
            for (i, size) in sizes.iter().enumerate() {
                let worker = format!("w{}", i % 3);
                for item in leases.claim_batch(*size, &worker).unwrap() {
                    prop_assert!(seen.insert(item.id));
                    prop_assert!(item.attempts <= item.max_attempts);
                }
            }
            prop_assert!(seen.len() <= count);
        }
    }
}
