//! Queue item model and its state machine
//!
//! ```text
//! pending ──claim──▶ processing ──success──────────▶ completed
//!    ▲                   │  ──permanent failure───▶ failed
//!    │                   │  ──transient, no attempts left──▶ failed
//!    └──transient / lease expiry, attempts left──┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::AlertId;

pub type QueueItemId = Uuid;

/// Error message stamped on items whose worker lease ran out
pub const LEASE_EXPIRED: &str = "lease expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Completed and failed items never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationKind {
    Scheduled,
    Manual,
    ThresholdBreach,
}

/// What a worker reports after evaluating a claimed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default)]
        result: serde_json::Value,
    },
    TransientFailure { message: String },
    PermanentFailure { message: String },
}

/// One scheduled evaluation of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub alert_id: AlertId,
    pub kind: EvaluationKind,
    pub status: QueueStatus,
    /// Lower value is claimed first
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Result of applying an outcome to a processing item
#[derive(Debug, Clone)]
pub struct Transition {
    pub item: QueueItem,
    /// A transient failure arrived with no attempts left
    pub exhausted: bool,
}

impl QueueItem {
    pub fn new(
        alert_id: AlertId,
        kind: EvaluationKind,
        priority: i32,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            alert_id,
            kind,
            status: QueueStatus::Pending,
            priority,
            scheduled_at,
            created_at: now,
            updated_at: now,
            processed_at: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            worker_id: None,
            lease_expires_at: None,
            error_message: None,
            result: None,
        }
    }

    /// Override the creation time (and the matching update stamp)
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Eligible for a claim at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending
            && self.scheduled_at <= now
            && self.attempts < self.max_attempts
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == QueueStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing
            && self.lease_expires_at.map(|t| t <= now).unwrap_or(false)
    }

    pub fn pending_key(&self) -> PendingKey {
        PendingKey {
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// State after `worker_id` claims this item. A lease reaching past the
    /// representable calendar never expires.
    pub fn claimed_by(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_ttl: Option<chrono::Duration>,
    ) -> QueueItem {
        let mut next = self.clone();
        next.status = QueueStatus::Processing;
        next.attempts += 1;
        next.worker_id = Some(worker_id.to_string());
        next.lease_expires_at = lease_ttl.and_then(|ttl| now.checked_add_signed(ttl));
        next.updated_at = now;
        next
    }

    /// State after the owning worker reports `outcome`
    pub fn apply_outcome(&self, outcome: Outcome, now: DateTime<Utc>) -> Transition {
        let mut next = self.clone();
        next.lease_expires_at = None;
        next.updated_at = now;

        let mut exhausted = false;
        match outcome {
            Outcome::Success { result } => {
                next.status = QueueStatus::Completed;
                next.processed_at = Some(now);
                next.result = Some(result);
                next.error_message = None;
            }
            Outcome::PermanentFailure { message } => {
                next.status = QueueStatus::Failed;
                next.processed_at = Some(now);
                next.error_message = Some(message);
            }
            Outcome::TransientFailure { message } => {
                next.error_message = Some(message);
                if next.attempts < next.max_attempts {
                    next.release();
                } else {
                    next.status = QueueStatus::Failed;
                    next.processed_at = Some(now);
                    exhausted = true;
                }
            }
        }

        Transition {
            item: next,
            exhausted,
        }
    }

    /// State after the lease on a processing item ran out without a report
    pub fn expire_lease(&self, now: DateTime<Utc>) -> QueueItem {
        let mut next = self.clone();
        next.lease_expires_at = None;
        next.updated_at = now;
        next.error_message = Some(LEASE_EXPIRED.to_string());

        if next.attempts < next.max_attempts {
            next.release();
        } else {
            next.status = QueueStatus::Failed;
            next.processed_at = Some(now);
        }
        next
    }

    /// Hand the item back to the pending pool, keeping its attempt count
    fn release(&mut self) {
        self.status = QueueStatus::Pending;
        self.worker_id = None;
    }
}

/// Ordering key for the pending index: priority, then due time, then FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub id: QueueItemId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(max_attempts: u32) -> QueueItem {
        QueueItem::new(Uuid::new_v4(), EvaluationKind::Scheduled, 5, Utc::now(), max_attempts)
    }

    #[test]
    fn test_claim_increments_attempts() {
        let now = Utc::now();
        let claimed = item(3).claimed_by("w1", now, Some(Duration::seconds(30)));
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert_eq!(claimed.lease_expires_at, Some(now + Duration::seconds(30)));
        assert!(claimed.is_owned_by("w1"));
        assert!(!claimed.is_owned_by("w2"));
    }

    #[test]
    fn test_unrepresentable_lease_never_expires() {
        let now = Utc::now();
        let ttl = Duration::from_std(std::time::Duration::from_secs(100_000_000_000_000)).unwrap();
        let claimed = item(3).claimed_by("w1", now, Some(ttl));
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.lease_expires_at, None);
        assert!(!claimed.lease_expired(now));
    }

    #[test]
    fn test_future_item_not_claimable() {
        let now = Utc::now();
        let mut it = item(3);
        it.scheduled_at = now + Duration::minutes(5);
        assert!(!it.is_claimable(now));
        assert!(it.is_claimable(now + Duration::minutes(5)));
    }

    #[test]
    fn test_transient_failure_requeues_with_attempts_left() {
        let now = Utc::now();
        let claimed = item(3).claimed_by("w1", now, None);
        let t = claimed.apply_outcome(
            Outcome::TransientFailure {
                message: "timeout".into(),
            },
            now,
        );
        assert!(!t.exhausted);
        assert_eq!(t.item.status, QueueStatus::Pending);
        assert_eq!(t.item.attempts, 1);
        assert_eq!(t.item.worker_id, None);
        assert_eq!(t.item.error_message.as_deref(), Some("timeout"));
        assert!(t.item.processed_at.is_none());
    }

    #[test]
    fn test_transient_failure_at_max_fails() {
        let now = Utc::now();
        let claimed = item(1).claimed_by("w1", now, None);
        let t = claimed.apply_outcome(
            Outcome::TransientFailure {
                message: "still down".into(),
            },
            now,
        );
        assert!(t.exhausted);
        assert_eq!(t.item.status, QueueStatus::Failed);
        assert_eq!(t.item.processed_at, Some(now));
        assert_eq!(t.item.error_message.as_deref(), Some("still down"));
    }

    #[test]
    fn test_success_completes() {
        let now = Utc::now();
        let claimed = item(3).claimed_by("w1", now, Some(Duration::seconds(10)));
        let t = claimed.apply_outcome(
            Outcome::Success {
                result: serde_json::json!({"value": 12.5}),
            },
            now,
        );
        assert_eq!(t.item.status, QueueStatus::Completed);
        assert!(t.item.status.is_terminal());
        assert_eq!(t.item.lease_expires_at, None);
        assert_eq!(t.item.result, Some(serde_json::json!({"value": 12.5})));
    }

    #[test]
    fn test_expire_lease() {
        let now = Utc::now();
        let claimed = item(2).claimed_by("w1", now, Some(Duration::seconds(1)));
        assert!(!claimed.lease_expired(now));
        assert!(claimed.lease_expired(now + Duration::seconds(1)));

        let released = claimed.expire_lease(now + Duration::seconds(2));
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.error_message.as_deref(), Some(LEASE_EXPIRED));

        let last = released
            .claimed_by("w2", now, Some(Duration::seconds(1)))
            .expire_lease(now + Duration::seconds(5));
        assert_eq!(last.status, QueueStatus::Failed);
        assert_eq!(last.attempts, 2);
    }

    #[test]
    fn test_pending_key_order() {
        let now = Utc::now();
        let mut urgent = item(3);
        urgent.priority = 1;
        urgent.scheduled_at = now;
        let mut early = item(3);
        early.scheduled_at = now - Duration::minutes(10);
        let mut late = item(3);
        late.scheduled_at = now;

        let mut keys = vec![late.pending_key(), urgent.pending_key(), early.pending_key()];
        keys.sort();
        assert_eq!(keys[0].id, urgent.id);
        assert_eq!(keys[1].id, early.id);
        assert_eq!(keys[2].id, late.id);
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome: Outcome =
            serde_json::from_str(r#"{"type":"transient_failure","message":"timeout"}"#).unwrap();
        assert_eq!(
            outcome,
            Outcome::TransientFailure {
                message: "timeout".into()
            }
        );
        let outcome: Outcome = serde_json::from_str(r#"{"type":"success"}"#).unwrap();
        assert_eq!(
            outcome,
            Outcome::Success {
                result: serde_json::Value::Null
            }
        );
    }
}
