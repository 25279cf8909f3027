//! Alert definition types

use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::triggers::Severity;

pub type AlertId = Uuid;

/// Alert definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert ID
    pub id: AlertId,
    /// Owning principal
    pub owner: String,
    /// Metric this alert watches
    pub metric_kind: MetricKind,
    /// Comparison applied between observed value and threshold
    pub comparison: ComparisonOp,
    pub threshold: f64,
    pub unit: String,
    /// Inactive alerts are never scheduled
    pub active: bool,
    /// Back-to-back breaches needed before a trigger is actionable
    pub consecutive_breaches_required: u32,
    /// How often the alert should be evaluated
    #[serde(with = "window_serde")]
    pub evaluation_window: Duration,
    pub notification: NotificationPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Create a new alert
    pub fn new(
        owner: impl Into<String>,
        metric_kind: MetricKind,
        comparison: ComparisonOp,
        threshold: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            metric_kind,
            comparison,
            threshold,
            unit: metric_kind.default_unit().to_string(),
            active: true,
            consecutive_breaches_required: 1,
            evaluation_window: Duration::from_secs(300),
            notification: NotificationPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_consecutive_breaches(mut self, required: u32) -> Self {
        self.consecutive_breaches_required = required;
        self
    }

    pub fn with_evaluation_window(mut self, window: Duration) -> Self {
        self.evaluation_window = window;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_notification(mut self, policy: NotificationPolicy) -> Self {
        self.notification = policy;
        self
    }

    /// Check the fields the registry requires before accepting an alert
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(CoreError::InvalidInput("alert owner is required".into()));
        }
        if !self.threshold.is_finite() {
            return Err(CoreError::InvalidInput(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        if self.consecutive_breaches_required == 0 {
            return Err(CoreError::InvalidInput(
                "consecutive_breaches_required must be at least 1".into(),
            ));
        }
        if self.evaluation_window.is_zero() {
            return Err(CoreError::InvalidInput(
                "evaluation_window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ResponseTime,
    ErrorRate,
    Uptime,
}

impl MetricKind {
    pub fn default_unit(&self) -> &'static str {
        match self {
            MetricKind::ResponseTime => "ms",
            MetricKind::ErrorRate => "percent",
            MetricKind::Uptime => "percent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "=")]
    Equal,
}

impl ComparisonOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::GreaterThan => ">",
            ComparisonOp::LessThan => "<",
            ComparisonOp::GreaterOrEqual => ">=",
            ComparisonOp::LessOrEqual => "<=",
            ComparisonOp::Equal => "=",
        }
    }
}

/// How and when notifications for this alert are delivered downstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPolicy {
    pub frequency: NotificationFrequency,
    pub format: NotificationFormat,
    /// Triggers below this severity are not notified
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            frequency: NotificationFrequency::Immediate,
            format: NotificationFormat::Text,
            min_severity: None,
            quiet_hours: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationFrequency {
    Immediate,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationFormat {
    Text,
    Html,
    Json,
}

/// Daily window (UTC) during which notifications are held back.
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Serializes the evaluation window as whole seconds
mod window_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
