//! Consecutive-breach ledger
//!
//! At most one unresolved trigger exists per alert. Observations for an
//! alert are serialized through its slot in the `open` index, so streak
//! updates for different alerts never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::types::{FixedSeverity, ResolutionKind, SeverityPolicy, Trigger, TriggerId};
use crate::alerts::{AccessPolicy, AlertId, AlertRegistry};
use crate::error::{CoreError, RecordKind, Result};
use crate::storage::{Journal, JournalEntry};

/// Effect of one observation on the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Observation {
    /// First breach of a new streak
    Opened { trigger: Trigger, actionable: bool },
    /// Another breach on an existing streak
    Continued { trigger: Trigger, actionable: bool },
    /// A non-breaching value ended the streak
    Resolved { trigger: Trigger },
    /// Non-breaching value with no open streak
    Clear,
}

impl Observation {
    pub fn trigger(&self) -> Option<&Trigger> {
        match self {
            Observation::Opened { trigger, .. }
            | Observation::Continued { trigger, .. }
            | Observation::Resolved { trigger } => Some(trigger),
            Observation::Clear => None,
        }
    }
}

pub struct TriggerLedger {
    registry: Arc<dyn AlertRegistry>,
    severity: Arc<dyn SeverityPolicy>,
    triggers: DashMap<TriggerId, Trigger>,
    /// Alert -> its unresolved trigger
    open: DashMap<AlertId, TriggerId>,
    journal: Option<Arc<dyn Journal>>,
}

impl TriggerLedger {
    pub fn new(registry: Arc<dyn AlertRegistry>) -> Self {
        Self {
            registry,
            severity: Arc::new(FixedSeverity::default()),
            triggers: DashMap::new(),
            open: DashMap::new(),
            journal: None,
        }
    }

    pub fn with_severity_policy(mut self, policy: Arc<dyn SeverityPolicy>) -> Self {
        self.severity = policy;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Load previously journaled triggers
    pub fn restore(&self, triggers: impl IntoIterator<Item = Trigger>) {
        for trigger in triggers {
            if !trigger.is_resolved() {
                self.open.insert(trigger.alert_id, trigger.id);
            }
            self.triggers.insert(trigger.id, trigger);
        }
    }

    pub fn record_observation(
        &self,
        alert_id: AlertId,
        metric_value: f64,
        is_breach: bool,
    ) -> Result<Observation> {
        self.record_observation_at(alert_id, metric_value, is_breach, Utc::now())
    }

    /// Fold one evaluation result into the alert's breach streak
    pub fn record_observation_at(
        &self,
        alert_id: AlertId,
        metric_value: f64,
        is_breach: bool,
        now: DateTime<Utc>,
    ) -> Result<Observation> {
        let alert = self.registry.get(&alert_id)?;
        let required = alert.consecutive_breaches_required;

        match self.open.entry(alert_id) {
            Entry::Occupied(slot) => {
                let trigger_id = *slot.get();
                let mut trigger = self
                    .triggers
                    .get(&trigger_id)
                    .map(|t| t.clone())
                    .ok_or_else(|| CoreError::not_found(RecordKind::Trigger, trigger_id))?;

                if is_breach {
                    trigger.breach_count += 1;
                    trigger.metric_value = metric_value;
                    trigger.last_breach_at = now;
                    self.commit(&trigger)?;

                    tracing::debug!(
                        alert_id = %alert_id,
                        trigger_id = %trigger_id,
                        breach_count = trigger.breach_count,
                        "Breach streak continued"
                    );
                    let actionable = trigger.is_actionable(required);
                    Ok(Observation::Continued {
                        trigger,
                        actionable,
                    })
                } else {
                    trigger.resolve(ResolutionKind::Automatic, now);
                    self.commit(&trigger)?;
                    slot.remove();

                    tracing::info!(
                        alert_id = %alert_id,
                        trigger_id = %trigger_id,
                        breach_count = trigger.breach_count,
                        "Trigger resolved automatically"
                    );
                    Ok(Observation::Resolved { trigger })
                }
            }
            Entry::Vacant(slot) => {
                if !is_breach {
                    return Ok(Observation::Clear);
                }

                let severity = self.severity.severity(&alert, metric_value);
                let trigger = Trigger::open(alert_id, metric_value, severity, now);
                self.commit(&trigger)?;
                slot.insert(trigger.id);

                tracing::info!(
                    alert_id = %alert_id,
                    trigger_id = %trigger.id,
                    severity = ?severity,
                    "Trigger opened"
                );
                let actionable = trigger.is_actionable(required);
                Ok(Observation::Opened {
                    trigger,
                    actionable,
                })
            }
        }
    }

    pub fn resolve_manually(&self, trigger_id: TriggerId) -> Result<Trigger> {
        self.resolve_at(trigger_id, ResolutionKind::Manual, Utc::now())
    }

    pub fn resolve_by_timeout(&self, trigger_id: TriggerId) -> Result<Trigger> {
        self.resolve_at(trigger_id, ResolutionKind::Timeout, Utc::now())
    }

    /// Close an open trigger. Absent and already-resolved triggers are
    /// both reported as `NotFound`.
    pub fn resolve_at(
        &self,
        trigger_id: TriggerId,
        kind: ResolutionKind,
        now: DateTime<Utc>,
    ) -> Result<Trigger> {
        let not_found = || CoreError::not_found(RecordKind::Trigger, trigger_id);

        let alert_id = self
            .triggers
            .get(&trigger_id)
            .map(|t| t.alert_id)
            .ok_or_else(not_found)?;

        let Entry::Occupied(slot) = self.open.entry(alert_id) else {
            return Err(not_found());
        };
        if *slot.get() != trigger_id {
            return Err(not_found());
        }

        let mut trigger = self
            .triggers
            .get(&trigger_id)
            .map(|t| t.clone())
            .ok_or_else(not_found)?;
        trigger.resolve(kind, now);
        self.commit(&trigger)?;
        slot.remove();

        tracing::info!(
            alert_id = %alert_id,
            trigger_id = %trigger_id,
            resolution = ?kind,
            "Trigger resolved"
        );
        Ok(trigger)
    }

    pub fn get(&self, trigger_id: &TriggerId) -> Result<Trigger> {
        self.triggers
            .get(trigger_id)
            .map(|t| t.clone())
            .ok_or_else(|| CoreError::not_found(RecordKind::Trigger, *trigger_id))
    }

    pub fn open_for_alert(&self, alert_id: &AlertId) -> Option<Trigger> {
        let trigger_id = self.open.get(alert_id).map(|id| *id)?;
        self.triggers.get(&trigger_id).map(|t| t.clone())
    }

    /// Every trigger recorded for an alert, oldest first
    pub fn list_for_alert(&self, alert_id: &AlertId) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = self
            .triggers
            .iter()
            .filter(|t| t.alert_id == *alert_id)
            .map(|t| t.clone())
            .collect();
        triggers.sort_by_key(|t| t.triggered_at);
        triggers
    }

    /// `list_for_alert` behind the caller's access policy
    pub fn list_for_alert_as(
        &self,
        caller: &str,
        alert_id: &AlertId,
        policy: &dyn AccessPolicy,
    ) -> Result<Vec<Trigger>> {
        self.registry.get_for(caller, alert_id, policy)?;
        Ok(self.list_for_alert(alert_id))
    }

    /// Whether a trigger has reached its alert's consecutive-breach requirement
    pub fn is_actionable(&self, trigger_id: &TriggerId) -> Result<bool> {
        let trigger = self.get(trigger_id)?;
        let alert = self.registry.get(&trigger.alert_id)?;
        Ok(trigger.is_actionable(alert.consecutive_breaches_required))
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    fn commit(&self, trigger: &Trigger) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::Trigger {
                trigger: trigger.clone(),
            })?;
        }
        self.triggers.insert(trigger.id, trigger.clone());
        Ok(())
    }
}
