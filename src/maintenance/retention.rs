//! Retention horizon enforcement for queue items and metrics

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::queue::EvaluationQueue;

pub const QUEUE_ITEMS: &str = "queue_items";
pub const METRICS: &str = "metrics";
/// Reported alone when a sweep deleted nothing
pub const NONE: &str = "none";

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Age after which completed and failed items are deleted
    pub queue_retention: Duration,
    pub metrics_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            queue_retention: Duration::from_secs(30 * 24 * 60 * 60),
            metrics_retention: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

impl RetentionConfig {
    pub fn with_queue_retention(mut self, retention: Duration) -> Self {
        self.queue_retention = retention;
        self
    }

    pub fn with_metrics_retention(mut self, retention: Duration) -> Self {
        self.metrics_retention = retention;
        self
    }
}

/// Deleted record count per category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SweepReport(BTreeMap<String, usize>);

impl SweepReport {
    fn from_counts(counts: &[(&str, usize)]) -> Self {
        let deleted: BTreeMap<String, usize> = counts
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(category, count)| (category.to_string(), *count))
            .collect();

        if deleted.is_empty() {
            SweepReport(BTreeMap::from([(NONE.to_string(), 0)]))
        } else {
            SweepReport(deleted)
        }
    }

    pub fn get(&self, category: &str) -> usize {
        self.0.get(category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn categories(&self) -> &BTreeMap<String, usize> {
        &self.0
    }
}

pub struct RetentionSweeper {
    queue: Arc<EvaluationQueue>,
    recorder: Arc<MetricsRecorder>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        queue: Arc<EvaluationQueue>,
        recorder: Arc<MetricsRecorder>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            queue,
            recorder,
            config,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Delete terminal queue items and metrics past their horizons as of `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let queue_cutoff = cutoff(now, self.config.queue_retention);
        let metrics_cutoff = cutoff(now, self.config.metrics_retention);

        let items = self.queue.purge_terminal_before(queue_cutoff)?;
        let metrics = self.recorder.purge_before(metrics_cutoff)?;

        let report = SweepReport::from_counts(&[(QUEUE_ITEMS, items), (METRICS, metrics)]);
        if !report.is_empty() {
            tracing::info!(
                queue_items = items,
                metrics,
                "Retention sweep deleted expired records"
            );
        }
        Ok(report)
    }
}

/// Oldest creation time still retained; saturates for horizons beyond the calendar
fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|horizon| now.checked_sub_signed(horizon))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertId, ComparisonOp, InMemoryAlertRegistry, MetricKind};
    use crate::metrics::NewMetric;
    use crate::queue::{
        EnqueueOptions, EvaluationKind, Outcome, QueueConfig, QueueStatus, WorkerLeaseManager,
    };
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        queue: Arc<EvaluationQueue>,
        leases: WorkerLeaseManager,
        recorder: Arc<MetricsRecorder>,
        sweeper: RetentionSweeper,
        alert_id: AlertId,
    }

    fn setup() -> Fixture {
        let registry = Arc::new(InMemoryAlertRegistry::new());
        let alert_id = registry
            .create(Alert::new(
                "ops",
                MetricKind::ResponseTime,
                ComparisonOp::GreaterThan,
                250.0,
            ))
            .unwrap();
        let queue = Arc::new(EvaluationQueue::new(registry, QueueConfig::default()));
        let recorder = Arc::new(MetricsRecorder::new());
        Fixture {
            leases: WorkerLeaseManager::new(Arc::clone(&queue)),
            sweeper: RetentionSweeper::new(
                Arc::clone(&queue),
                Arc::clone(&recorder),
                RetentionConfig::default(),
            ),
            queue,
            recorder,
            alert_id,
        }
    }

    /// Enqueue at `at` and drive the item to completion
    fn completed_item(fx: &Fixture, at: DateTime<Utc>) {
        let id = fx
            .queue
            .enqueue_at(fx.alert_id, EvaluationKind::Scheduled, EnqueueOptions::default(), at)
            .unwrap();
        let claimed = fx.leases.claim_batch_at(1, "w1", at).unwrap();
        assert_eq!(claimed[0].id, id);
        fx.queue
            .report_outcome_at(
                id,
                "w1",
                Outcome::Success {
                    result: serde_json::Value::Null,
                },
                at,
            )
            .unwrap();
    }

    #[test]
    fn test_nothing_to_sweep() {
        let fx = setup();
        let report = fx.sweeper.sweep().unwrap();
        assert_eq!(report.categories().len(), 1);
        assert_eq!(report.get(NONE), 0);
        assert!(report.is_empty());
    }

    #[test]
    fn test_sweep_deletes_expired_terminal_items_and_metrics() {
        let fx = setup();
        let now = Utc::now();

        completed_item(&fx, now - ChronoDuration::days(31));
        completed_item(&fx, now - ChronoDuration::days(1));
        fx.recorder
            .record_at(NewMetric::new("old", 1.0, "queue"), now - ChronoDuration::days(91))
            .unwrap();
        fx.recorder
            .record_at(NewMetric::new("fresh", 1.0, "queue"), now)
            .unwrap();

        let report = fx.sweeper.sweep_at(now).unwrap();
        assert_eq!(report.get(QUEUE_ITEMS), 1);
        assert_eq!(report.get(METRICS), 1);
        assert_eq!(report.get(NONE), 0);
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.recorder.len(), 1);

        // Idempotent
        let again = fx.sweeper.sweep_at(now).unwrap();
        assert!(again.is_empty());
        assert_eq!(again.get(NONE), 0);
    }

    #[test]
    fn test_sweep_keeps_old_pending_and_processing() {
        let fx = setup();
        let now = Utc::now();
        let long_ago = now - ChronoDuration::days(365);

        for _ in 0..2 {
            fx.queue
                .enqueue_at(
                    fx.alert_id,
                    EvaluationKind::Scheduled,
                    EnqueueOptions::default(),
                    long_ago,
                )
                .unwrap();
        }
        fx.leases.claim_batch_at(1, "w1", long_ago).unwrap();

        let report = fx.sweeper.sweep_at(now).unwrap();
        assert!(report.is_empty());

        let counts = fx.queue.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
    }

    #[test]
    fn test_sweep_deletes_failed_items() {
        let fx = setup();
        let now = Utc::now();
        let at = now - ChronoDuration::days(40);

        let id = fx
            .queue
            .enqueue_at(fx.alert_id, EvaluationKind::Manual, EnqueueOptions::default(), at)
            .unwrap();
        fx.leases.claim_batch_at(1, "w1", at).unwrap();
        fx.queue
            .report_outcome_at(
                id,
                "w1",
                Outcome::PermanentFailure {
                    message: "bad query".into(),
                },
                at,
            )
            .unwrap();
        assert_eq!(fx.queue.get(&id).unwrap().status, QueueStatus::Failed);

        let report = fx.sweeper.sweep_at(now).unwrap();
        assert_eq!(report.get(QUEUE_ITEMS), 1);
        assert!(fx.queue.is_empty());
    }
}
