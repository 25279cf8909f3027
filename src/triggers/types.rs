//! Trigger records and severity mapping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::{Alert, AlertId};

pub type TriggerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Automatic,
    Manual,
    Timeout,
}

/// A streak of consecutive breaches for one alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub alert_id: AlertId,
    /// When the streak started
    pub triggered_at: DateTime<Utc>,
    /// Most recent breach in the streak
    pub last_breach_at: DateTime<Utc>,
    /// Most recently observed breaching value
    pub metric_value: f64,
    pub breach_count: u32,
    pub severity: Severity,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ResolutionKind>,
}

impl Trigger {
    pub(crate) fn open(
        alert_id: AlertId,
        metric_value: f64,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id,
            triggered_at: now,
            last_breach_at: now,
            metric_value,
            breach_count: 1,
            severity,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Unresolved and at or past the alert's consecutive-breach requirement
    pub fn is_actionable(&self, consecutive_breaches_required: u32) -> bool {
        !self.is_resolved() && self.breach_count >= consecutive_breaches_required
    }

    pub(crate) fn resolve(&mut self, kind: ResolutionKind, now: DateTime<Utc>) {
        self.resolved_at = Some(now);
        self.resolution = Some(kind);
    }
}

/// Chooses the severity of a newly opened trigger
pub trait SeverityPolicy: Send + Sync {
    fn severity(&self, alert: &Alert, metric_value: f64) -> Severity;
}

/// Assigns the same severity to every trigger
#[derive(Debug, Clone, Copy)]
pub struct FixedSeverity(pub Severity);

impl Default for FixedSeverity {
    fn default() -> Self {
        FixedSeverity(Severity::Medium)
    }
}

impl SeverityPolicy for FixedSeverity {
    fn severity(&self, _alert: &Alert, _metric_value: f64) -> Severity {
        self.0
    }
}
