//! Alert registry and the read-side authorization boundary

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use super::config::{Alert, AlertId};
use crate::error::{CoreError, RecordKind, Result};
use crate::storage::{Journal, JournalEntry};

/// Read access to alert definitions.
///
/// The queue and ledger only ever read through this trait.
pub trait AlertRegistry: Send + Sync {
    fn exists(&self, id: &AlertId) -> bool;

    fn get(&self, id: &AlertId) -> Result<Alert>;

    /// Active alerts, used by the evaluation scheduler
    fn list_active(&self) -> Vec<Alert>;

    /// Fetch an alert on behalf of `caller`; denied reads look like absence
    fn get_for(&self, caller: &str, id: &AlertId, policy: &dyn AccessPolicy) -> Result<Alert> {
        let alert = self.get(id)?;
        if policy.can_view(caller, &alert) {
            Ok(alert)
        } else {
            Err(CoreError::not_found(RecordKind::Alert, *id))
        }
    }
}

/// Maps a caller identity to the alerts it may see
pub trait AccessPolicy: Send + Sync {
    fn can_view(&self, caller: &str, alert: &Alert) -> bool;
}

/// Every caller sees every alert
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_view(&self, _caller: &str, _alert: &Alert) -> bool {
        true
    }
}

/// Callers only see alerts they own
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerOnly;

impl AccessPolicy for OwnerOnly {
    fn can_view(&self, caller: &str, alert: &Alert) -> bool {
        alert.owner == caller
    }
}

/// In-memory alert registry
#[derive(Default)]
pub struct InMemoryAlertRegistry {
    alerts: RwLock<HashMap<AlertId, Alert>>,
    journal: Option<Arc<dyn Journal>>,
}

impl InMemoryAlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Load previously journaled alerts
    pub fn restore(&self, alerts: impl IntoIterator<Item = Alert>) {
        let mut map = self.alerts.write();
        for alert in alerts {
            map.insert(alert.id, alert);
        }
    }

    /// Register a new alert
    pub fn create(&self, alert: Alert) -> Result<AlertId> {
        alert.validate()?;
        let id = alert.id;
        let mut alerts = self.alerts.write();
        if alerts.contains_key(&id) {
            return Err(CoreError::InvalidInput(format!("alert '{}' already exists", id)));
        }
        self.write_ahead(JournalEntry::Alert {
            alert: alert.clone(),
        })?;
        alerts.insert(id, alert);
        tracing::info!(alert_id = %id, "Registered alert");
        Ok(id)
    }

    /// Replace an alert definition; only its owner may do so
    pub fn update(&self, caller: &str, mut alert: Alert) -> Result<Alert> {
        alert.validate()?;
        let mut alerts = self.alerts.write();
        let existing = alerts
            .get(&alert.id)
            .ok_or_else(|| CoreError::not_found(RecordKind::Alert, alert.id))?;

        if existing.owner != caller {
            return Err(CoreError::not_found(RecordKind::Alert, alert.id));
        }

        alert.owner = existing.owner.clone();
        alert.created_at = existing.created_at;
        alert.updated_at = Utc::now();
        self.write_ahead(JournalEntry::Alert {
            alert: alert.clone(),
        })?;
        alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    /// Remove an alert; only its owner may do so
    pub fn remove(&self, caller: &str, id: &AlertId) -> Result<Alert> {
        let mut alerts = self.alerts.write();
        match alerts.get(id) {
            Some(alert) if alert.owner == caller => {}
            _ => return Err(CoreError::not_found(RecordKind::Alert, *id)),
        }
        self.write_ahead(JournalEntry::AlertRemoved { id: *id })?;
        let removed = alerts
            .remove(id)
            .ok_or_else(|| CoreError::not_found(RecordKind::Alert, *id))?;
        tracing::info!(alert_id = %id, "Removed alert");
        Ok(removed)
    }

    /// List the alerts visible to `caller`
    pub fn list_for(&self, caller: &str, policy: &dyn AccessPolicy) -> Vec<Alert> {
        let alerts = self.alerts.read();
        let mut visible: Vec<Alert> = alerts
            .values()
            .filter(|a| policy.can_view(caller, a))
            .cloned()
            .collect();
        visible.sort_by_key(|a| a.created_at);
        visible
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    fn write_ahead(&self, entry: JournalEntry) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        Ok(())
    }
}

impl AlertRegistry for InMemoryAlertRegistry {
    fn exists(&self, id: &AlertId) -> bool {
        self.alerts.read().contains_key(id)
    }

    fn get(&self, id: &AlertId) -> Result<Alert> {
        self.alerts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(RecordKind::Alert, *id))
    }

    fn list_active(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{ComparisonOp, MetricKind};
    use uuid::Uuid;

    fn alert(owner: &str) -> Alert {
        Alert::new(owner, MetricKind::ResponseTime, ComparisonOp::GreaterThan, 250.0)
    }

    #[test]
    fn test_create_and_get() {
        let registry = InMemoryAlertRegistry::new();
        let id = registry.create(alert("alice")).unwrap();

        assert!(registry.exists(&id));
        assert_eq!(registry.get(&id).unwrap().owner, "alice");
        assert!(!registry.exists(&Uuid::new_v4()));
        assert!(matches!(
            registry.get(&Uuid::new_v4()),
            Err(CoreError::NotFound { kind: RecordKind::Alert, .. })
        ));
    }

    #[test]
    fn test_create_rejects_invalid() {
        let registry = InMemoryAlertRegistry::new();
        let bad = alert("alice").with_consecutive_breaches(0);
        assert!(matches!(registry.create(bad), Err(CoreError::InvalidInput(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_is_owner_only() {
        let registry = InMemoryAlertRegistry::new();
        let original = alert("alice");
        let id = registry.create(original.clone()).unwrap();

        let mut changed = original.clone();
        changed.threshold = 900.0;
        assert!(registry.update("mallory", changed.clone()).is_err());

        let updated = registry.update("alice", changed).unwrap();
        assert_eq!(updated.threshold, 900.0);
        assert_eq!(registry.get(&id).unwrap().threshold, 900.0);
    }

    #[test]
    fn test_owner_only_policy_hides_foreign_alerts() {
        let registry = InMemoryAlertRegistry::new();
        let id = registry.create(alert("alice")).unwrap();
        registry.create(alert("bob")).unwrap();

        assert!(registry.get_for("alice", &id, &OwnerOnly).is_ok());
        assert!(matches!(
            registry.get_for("bob", &id, &OwnerOnly),
            Err(CoreError::NotFound { .. })
        ));
        assert!(registry.get_for("bob", &id, &AllowAll).is_ok());
        assert_eq!(registry.list_for("bob", &OwnerOnly).len(), 1);
        assert_eq!(registry.list_for("bob", &AllowAll).len(), 2);
    }

    #[test]
    fn test_list_active_skips_disabled() {
        let registry = InMemoryAlertRegistry::new();
        registry.create(alert("alice")).unwrap();
        registry.create(alert("alice").with_active(false)).unwrap();
        assert_eq!(registry.list_active().len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_requires_owner() {
        let registry = InMemoryAlertRegistry::new();
        let id = registry.create(alert("alice")).unwrap();
        assert!(registry.remove("bob", &id).is_err());
        assert!(registry.remove("alice", &id).is_ok());
        assert!(!registry.exists(&id));
    }

    #[test]
    fn test_journal_failure_leaves_registry_unchanged() {
        let journal = Arc::new(crate::storage::MemoryJournal::new());
        let registry = InMemoryAlertRegistry::new().with_journal(journal.clone());
        let id = registry.create(alert("alice")).unwrap();
        assert_eq!(journal.len(), 1);

        journal.set_failing(true);
        assert!(matches!(
            registry.create(alert("alice")),
            Err(CoreError::StorageFailure(_))
        ));
        assert!(registry.remove("alice", &id).is_err());
        assert!(registry.exists(&id));
        assert_eq!(registry.len(), 1);
    }
}
