//! Point-in-time queue and processing health

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::recorder::{MetricsRecorder, ALERTS_ERROR, ALERTS_PROCESSED, PROCESSING_TIME_MS};
use crate::queue::EvaluationQueue;

/// Default look-back for `snapshot`
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Processing rate and error rate are always computed over the last hour
const RATE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Pending items created within the window
    pub queue_size: usize,
    /// Processed evaluations per second over the last hour
    pub processing_rate: f64,
    /// Errors per processed evaluation over the last hour
    pub error_rate: f64,
    pub avg_processing_time_ms: f64,
    /// Age of the longest-waiting pending item
    pub queue_lag_seconds: f64,
    pub processing_count: usize,
    /// Items that failed within the window
    pub failed_count: usize,
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
}

/// Degraded / unhealthy cut-offs
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_lag_secs: f64,
    pub unhealthy_lag_secs: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            degraded_lag_secs: 300.0,
            unhealthy_lag_secs: 900.0,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, error_rate: f64, queue_lag_seconds: f64) -> HealthStatus {
        if error_rate >= self.unhealthy_error_rate || queue_lag_seconds >= self.unhealthy_lag_secs {
            HealthStatus::Unhealthy
        } else if error_rate >= self.degraded_error_rate
            || queue_lag_seconds >= self.degraded_lag_secs
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub thresholds: HealthThresholds,
    /// How long `cached_snapshot` reuses a computed snapshot
    pub cache_ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

impl HealthConfig {
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

pub struct HealthMonitor {
    queue: Arc<EvaluationQueue>,
    recorder: Arc<MetricsRecorder>,
    thresholds: HealthThresholds,
    /// Snapshots keyed by window length in seconds
    cache: Cache<u64, HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(queue: Arc<EvaluationQueue>, recorder: Arc<MetricsRecorder>) -> Self {
        Self::with_config(queue, recorder, HealthConfig::default())
    }

    pub fn with_config(
        queue: Arc<EvaluationQueue>,
        recorder: Arc<MetricsRecorder>,
        config: HealthConfig,
    ) -> Self {
        Self {
            queue,
            recorder,
            thresholds: config.thresholds,
            cache: Cache::builder()
                .max_capacity(64)
                .time_to_live(config.cache_ttl)
                .build(),
        }
    }

    pub fn snapshot(&self, window: Duration) -> HealthSnapshot {
        self.snapshot_at(Utc::now(), window)
    }

    /// Snapshot from cache if one for this window is still fresh
    pub fn cached_snapshot(&self, window: Duration) -> HealthSnapshot {
        self.cache
            .get_with(window.as_secs(), || self.snapshot(window))
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>, window: Duration) -> HealthSnapshot {
        let window_start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let rate_start = now - chrono::Duration::seconds(RATE_WINDOW_SECS);

        let processed = self.recorder.sum(ALERTS_PROCESSED, rate_start, now);
        let errors = self.recorder.sum(ALERTS_ERROR, rate_start, now);
        let processing_rate = processed / RATE_WINDOW_SECS as f64;
        let error_rate = if processed > 0.0 {
            errors / processed
        } else {
            0.0
        };

        let queue_lag_seconds = self
            .queue
            .oldest_pending_scheduled_at()
            .map(|oldest| (now - oldest).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
            .max(0.0);

        let snapshot = HealthSnapshot {
            queue_size: self.queue.pending_created_since(window_start),
            processing_rate,
            error_rate,
            avg_processing_time_ms: self.recorder.mean(PROCESSING_TIME_MS, window_start, now),
            queue_lag_seconds,
            processing_count: self.queue.counts().processing,
            failed_count: self.queue.failed_since(window_start),
            status: self.thresholds.classify(error_rate, queue_lag_seconds),
            generated_at: now,
        };

        if snapshot.status != HealthStatus::Healthy {
            tracing::warn!(
                status = ?snapshot.status,
                error_rate = snapshot.error_rate,
                queue_lag_seconds = snapshot.queue_lag_seconds,
                "Evaluation pipeline is not healthy"
            );
        }

        snapshot
    }
}
