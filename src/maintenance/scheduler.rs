//! Periodic enqueueing of scheduled evaluations

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time;

use crate::alerts::{AlertId, AlertRegistry};
use crate::error::{CoreError, Result};
use crate::queue::{EnqueueOptions, EvaluationKind, EvaluationQueue};

/// Enqueues one `Scheduled` evaluation per active alert each time its
/// evaluation window elapses
pub struct EvaluationScheduler {
    registry: Arc<dyn AlertRegistry>,
    queue: Arc<EvaluationQueue>,
    last_scheduled: DashMap<AlertId, DateTime<Utc>>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl EvaluationScheduler {
    pub fn new(
        registry: Arc<dyn AlertRegistry>,
        queue: Arc<EvaluationQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            last_scheduled: DashMap::new(),
            interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tick(&self) -> Result<usize> {
        self.tick_at(Utc::now())
    }

    /// Enqueue every active alert that is due as of `now`. Returns the
    /// number of items enqueued.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let active = self.registry.list_active();
        let active_ids: HashSet<AlertId> = active.iter().map(|alert| alert.id).collect();
        self.last_scheduled.retain(|id, _| active_ids.contains(id));

        let mut enqueued = 0;
        for alert in active {
            let window = chrono::Duration::from_std(alert.evaluation_window)
                .unwrap_or_else(|_| chrono::Duration::days(1));
            let due = self
                .last_scheduled
                .get(&alert.id)
                .map(|last| now - *last >= window)
                .unwrap_or(true);
            if !due {
                continue;
            }

            match self.queue.enqueue_at(
                alert.id,
                EvaluationKind::Scheduled,
                EnqueueOptions::default(),
                now,
            ) {
                Ok(_) => {
                    self.last_scheduled.insert(alert.id, now);
                    enqueued += 1;
                }
                // Removed between listing and enqueueing
                Err(CoreError::NotFound { .. }) => {
                    self.last_scheduled.remove(&alert.id);
                }
                Err(e) => return Err(e),
            }
        }

        if enqueued > 0 {
            tracing::info!(enqueued, "Scheduled evaluations");
        }
        Ok(enqueued)
    }

    /// Start the background scheduler
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::info!("Evaluation scheduler started with interval {:?}", self.interval);

            let mut interval = time::interval(self.interval);

            while self.running.load(Ordering::SeqCst) {
                interval.tick().await;

                if let Err(e) = self.tick() {
                    tracing::warn!(error = %e, "Scheduler tick failed");
                }
            }

            tracing::info!("Evaluation scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
