//! Append-only operational metric log

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::storage::{Journal, JournalEntry};

pub type MetricId = Uuid;

/// Evaluations completed by workers
pub const ALERTS_PROCESSED: &str = "alerts_processed";
/// Evaluations that ended in an error
pub const ALERTS_ERROR: &str = "alerts_error";
/// Wall time of a single evaluation
pub const PROCESSING_TIME_MS: &str = "processing_time_ms";

const DEFAULT_UNIT: &str = "count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A measurement to record
#[derive(Debug, Clone, Deserialize)]
pub struct NewMetric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NewMetric {
    pub fn new(name: impl Into<String>, value: f64, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: None,
            category: category.into(),
            subcategory: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_subcategory(mut self, subcategory: impl Into<String>) -> Self {
        self.subcategory = Some(subcategory.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("metric name is required".into()));
        }
        if self.category.trim().is_empty() {
            return Err(CoreError::InvalidInput("metric category is required".into()));
        }
        if !self.value.is_finite() {
            return Err(CoreError::InvalidInput(format!(
                "metric '{}' has a non-finite value",
                self.name
            )));
        }
        Ok(())
    }
}

/// Metrics ordered by creation time
pub struct MetricsRecorder {
    metrics: RwLock<BTreeMap<(DateTime<Utc>, MetricId), Metric>>,
    journal: Option<Arc<dyn Journal>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(BTreeMap::new()),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn restore(&self, metrics: impl IntoIterator<Item = Metric>) {
        let mut map = self.metrics.write();
        for metric in metrics {
            map.insert((metric.created_at, metric.id), metric);
        }
    }

    pub fn record(&self, metric: NewMetric) -> Result<Metric> {
        self.record_at(metric, Utc::now())
    }

    pub fn record_at(&self, metric: NewMetric, now: DateTime<Utc>) -> Result<Metric> {
        metric.validate()?;

        let metric = Metric {
            id: Uuid::new_v4(),
            name: metric.name,
            value: metric.value,
            unit: metric.unit.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
            category: metric.category,
            subcategory: metric.subcategory,
            tags: metric.tags,
            created_at: now,
        };

        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::Metric {
                metric: metric.clone(),
            })?;
        }
        self.metrics
            .write()
            .insert((metric.created_at, metric.id), metric.clone());

        tracing::debug!(name = %metric.name, value = metric.value, "Recorded metric");
        Ok(metric)
    }

    /// Values of `name` created in `[since, until]`
    fn values(&self, name: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<f64> {
        self.metrics
            .read()
            .range((since, Uuid::nil())..)
            .take_while(|((created_at, _), _)| *created_at <= until)
            .filter(|(_, metric)| metric.name == name)
            .map(|(_, metric)| metric.value)
            .collect()
    }

    pub fn sum(&self, name: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        self.values(name, since, until).iter().sum()
    }

    /// Mean of `name` over the range; 0 when nothing was recorded
    pub fn mean(&self, name: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        let values = self.values(name, since, until);
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    pub fn list(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<Metric> {
        self.metrics
            .read()
            .range((since, Uuid::nil())..)
            .take_while(|((created_at, _), _)| *created_at <= until)
            .map(|(_, metric)| metric.clone())
            .collect()
    }

    /// Delete metrics created strictly before `cutoff`
    pub(crate) fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let boundary = (cutoff, Uuid::nil());
        if self.metrics.read().range(..boundary).next().is_none() {
            return Ok(0);
        }

        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::MetricsExpired { before: cutoff })?;
        }

        let mut metrics = self.metrics.write();
        let kept = metrics.split_off(&boundary);
        let expired = std::mem::replace(&mut *metrics, kept);
        Ok(expired.len())
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
