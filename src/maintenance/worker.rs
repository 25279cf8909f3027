use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use super::retention::RetentionSweeper;
use crate::queue::WorkerLeaseManager;

/// Background worker that periodically sweeps expired records and reclaims
/// expired leases
pub struct MaintenanceWorker {
    sweeper: Arc<RetentionSweeper>,
    leases: Arc<WorkerLeaseManager>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl MaintenanceWorker {
    pub fn new(
        sweeper: Arc<RetentionSweeper>,
        leases: Arc<WorkerLeaseManager>,
        interval: Duration,
    ) -> Self {
        Self {
            sweeper,
            leases,
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background worker
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Maintenance worker started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;
                self.run_once();
            }

            tracing::info!("Maintenance worker stopped");
        })
    }

    /// One reclaim and sweep pass; failures are logged and retried next tick
    pub fn run_once(&self) {
        match self.leases.reclaim_expired() {
            Ok(report) if report.total() > 0 => {
                tracing::info!(
                    requeued = report.requeued,
                    failed = report.failed,
                    "Maintenance reclaimed expired leases"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Lease reclaim failed"),
        }

        if let Err(e) = self.sweeper.sweep() {
            tracing::warn!(error = %e, "Retention sweep failed");
        }
    }

    /// Stop the worker
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, ComparisonOp, InMemoryAlertRegistry, MetricKind};
    use crate::maintenance::RetentionConfig;
    use crate::metrics::MetricsRecorder;
    use crate::queue::{EnqueueOptions, EvaluationKind, EvaluationQueue, Outcome, QueueConfig, QueueStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn test_worker_sweeps_and_reclaims() {
        let registry = Arc::new(InMemoryAlertRegistry::new());
        let alert_id = registry
            .create(Alert::new(
                "ops",
                MetricKind::ResponseTime,
                ComparisonOp::GreaterThan,
                800.0,
            ))
            .unwrap();
        let queue = Arc::new(EvaluationQueue::new(
            registry,
            QueueConfig::default().with_lease_ttl(Some(Duration::from_secs(60))),
        ));
        let leases = Arc::new(WorkerLeaseManager::new(Arc::clone(&queue)));
        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&queue),
            Arc::new(MetricsRecorder::new()),
            RetentionConfig::default(),
        ));

        // Completed long ago: swept
        let old = Utc::now() - chrono::Duration::days(45);
        let done = queue
            .enqueue_at(alert_id, EvaluationKind::Manual, EnqueueOptions::default(), old)
            .unwrap();
        leases.claim_batch_at(1, "w1", old).unwrap();
        queue
            .report_outcome_at(
                done,
                "w1",
                Outcome::Success {
                    result: serde_json::json!({"value": 120}),
                },
                old,
            )
            .unwrap();

        // Claimed ten minutes ago with a one minute lease: reclaimed
        let stale = Utc::now() - chrono::Duration::minutes(10);
        let stuck = queue
            .enqueue_at(alert_id, EvaluationKind::Manual, EnqueueOptions::default(), stale)
            .unwrap();
        leases.claim_batch_at(1, "w2", stale).unwrap();

        let worker = Arc::new(MaintenanceWorker::new(
            sweeper,
            Arc::clone(&leases),
            Duration::from_millis(10),
        ));
        let handle = Arc::clone(&worker).start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop();
        handle.await.unwrap();

        assert!(queue.get(&done).is_err());
        let reclaimed = queue.get(&stuck).unwrap();
        assert_eq!(reclaimed.status, QueueStatus::Pending);
        assert_eq!(reclaimed.worker_id, None);
    }
}
