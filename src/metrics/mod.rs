//! Operational metrics and derived health

pub mod health;
pub mod recorder;

pub use health::{
    HealthConfig, HealthMonitor, HealthSnapshot, HealthStatus, HealthThresholds, DEFAULT_WINDOW,
};
pub use recorder::{
    Metric, MetricId, MetricsRecorder, NewMetric, ALERTS_ERROR, ALERTS_PROCESSED,
    PROCESSING_TIME_MS,
};
