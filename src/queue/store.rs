//! Evaluation queue: enqueue, outcome reporting and inspection
//!
//! Items live behind individual mutexes so that every status/attempts/worker
//! update is applied atomically per item. Pending items are additionally
//! indexed by `PendingKey`, which is what claimers walk.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::config::QueueConfig;
use super::item::{EvaluationKind, Outcome, PendingKey, QueueItem, QueueItemId, QueueStatus};
use crate::alerts::{AlertId, AlertRegistry};
use crate::error::{CoreError, RecordKind, Result};
use crate::storage::{Journal, JournalEntry};

/// Optional enqueue parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Defaults to the queue's configured priority
    pub priority: Option<i32>,
    /// Defaults to the enqueue time
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Number of items per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

pub struct EvaluationQueue {
    pub(super) config: QueueConfig,
    registry: Arc<dyn AlertRegistry>,
    pub(super) items: DashMap<QueueItemId, Arc<Mutex<QueueItem>>>,
    /// Keys of every pending item, in claim order
    pub(super) pending: RwLock<BTreeSet<PendingKey>>,
    journal: Option<Arc<dyn Journal>>,
}

impl EvaluationQueue {
    pub fn new(registry: Arc<dyn AlertRegistry>, config: QueueConfig) -> Self {
        Self {
            config,
            registry,
            items: DashMap::new(),
            pending: RwLock::new(BTreeSet::new()),
            journal: None,
        }
    }

    /// Journal every mutation before applying it
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Load previously journaled items
    pub fn restore(&self, items: impl IntoIterator<Item = QueueItem>) {
        let mut pending = self.pending.write();
        for item in items {
            if item.status == QueueStatus::Pending {
                pending.insert(item.pending_key());
            }
            self.items.insert(item.id, Arc::new(Mutex::new(item)));
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue an evaluation with default priority, due now
    pub fn enqueue(&self, alert_id: AlertId, kind: EvaluationKind) -> Result<QueueItemId> {
        self.enqueue_at(alert_id, kind, EnqueueOptions::default(), Utc::now())
    }

    pub fn enqueue_with(
        &self,
        alert_id: AlertId,
        kind: EvaluationKind,
        options: EnqueueOptions,
    ) -> Result<QueueItemId> {
        self.enqueue_at(alert_id, kind, options, Utc::now())
    }

    /// Enqueue an evaluation as of `now`.
    ///
    /// Pending items for the same alert are not deduplicated.
    pub fn enqueue_at(
        &self,
        alert_id: AlertId,
        kind: EvaluationKind,
        options: EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<QueueItemId> {
        if !self.registry.exists(&alert_id) {
            return Err(CoreError::not_found(RecordKind::Alert, alert_id));
        }

        let item = QueueItem::new(
            alert_id,
            kind,
            options.priority.unwrap_or(self.config.default_priority),
            options.scheduled_at.unwrap_or(now),
            self.config.max_attempts,
        )
        .created(now);
        let id = item.id;
        let key = item.pending_key();

        self.write_ahead(|| JournalEntry::QueueItem { item: item.clone() })?;

        self.items.insert(id, Arc::new(Mutex::new(item)));
        self.pending.write().insert(key);

        // The alert may have been removed and purged since the check above
        if !self.registry.exists(&alert_id) {
            self.discard(id);
            return Err(CoreError::not_found(RecordKind::Alert, alert_id));
        }

        tracing::info!(
            item_id = %id,
            alert_id = %alert_id,
            priority = key.priority,
            scheduled_at = %key.scheduled_at,
            "Enqueued evaluation"
        );

        Ok(id)
    }

    pub fn report_outcome(
        &self,
        item_id: QueueItemId,
        worker_id: &str,
        outcome: Outcome,
    ) -> Result<QueueItem> {
        self.report_outcome_at(item_id, worker_id, outcome, Utc::now())
    }

    /// Apply a worker's outcome to an item it currently owns.
    ///
    /// A transient failure with no attempts left commits the `failed` state
    /// and then returns `ExhaustedRetries`.
    pub fn report_outcome_at(
        &self,
        item_id: QueueItemId,
        worker_id: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let cell = self
            .cell(&item_id)
            .ok_or_else(|| CoreError::not_found(RecordKind::QueueItem, item_id))?;
        let mut item = cell.lock();

        if item.status != QueueStatus::Processing {
            return Err(CoreError::invalid_transition(
                item_id,
                format!("item is {}, not processing", item.status.as_str()),
            ));
        }
        if !item.is_owned_by(worker_id) {
            return Err(CoreError::invalid_transition(
                item_id,
                format!("item is not owned by worker '{}'", worker_id),
            ));
        }

        let transition = item.apply_outcome(outcome, now);
        self.write_ahead(|| JournalEntry::QueueItem {
            item: transition.item.clone(),
        })?;

        if transition.item.status == QueueStatus::Pending {
            self.pending.write().insert(transition.item.pending_key());
        }
        *item = transition.item;
        let updated = item.clone();
        drop(item);

        if transition.exhausted {
            let last_error = updated.error_message.clone().unwrap_or_default();
            tracing::warn!(
                item_id = %item_id,
                attempts = updated.attempts,
                error = %last_error,
                "Evaluation exhausted its retries"
            );
            return Err(CoreError::ExhaustedRetries {
                id: item_id,
                attempts: updated.attempts,
                last_error,
            });
        }

        tracing::debug!(
            item_id = %item_id,
            worker_id = %worker_id,
            status = updated.status.as_str(),
            attempts = updated.attempts,
            "Recorded evaluation outcome"
        );

        Ok(updated)
    }

    pub fn get(&self, item_id: &QueueItemId) -> Result<QueueItem> {
        self.cell(item_id)
            .map(|cell| cell.lock().clone())
            .ok_or_else(|| CoreError::not_found(RecordKind::QueueItem, *item_id))
    }

    /// All items for an alert, oldest first
    pub fn list_by_alert(&self, alert_id: &AlertId) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .snapshot_cells()
            .iter()
            .map(|cell| cell.lock().clone())
            .filter(|item| item.alert_id == *alert_id)
            .collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for cell in self.snapshot_cells() {
            match cell.lock().status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::Processing => counts.processing += 1,
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pending items created at or after `since`
    pub fn pending_created_since(&self, since: DateTime<Utc>) -> usize {
        self.pending
            .read()
            .iter()
            .filter(|key| key.created_at >= since)
            .count()
    }

    /// Due time of the longest-waiting pending item
    pub fn oldest_pending_scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.pending.read().iter().map(|key| key.scheduled_at).min()
    }

    /// Failed items whose last update is at or after `since`
    pub fn failed_since(&self, since: DateTime<Utc>) -> usize {
        self.snapshot_cells()
            .iter()
            .filter(|cell| {
                let item = cell.lock();
                item.status == QueueStatus::Failed && item.updated_at >= since
            })
            .count()
    }

    /// Remove every item belonging to a deleted alert
    pub fn purge_alert(&self, alert_id: &AlertId) -> Result<usize> {
        let ids: Vec<QueueItemId> = self
            .snapshot_cells()
            .iter()
            .filter_map(|cell| {
                let item = cell.lock();
                (item.alert_id == *alert_id).then_some(item.id)
            })
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }

        self.write_ahead(|| JournalEntry::QueueItemsDeleted { ids: ids.clone() })?;

        let mut removed = 0;
        for id in &ids {
            if let Some((_, cell)) = self.items.remove(id) {
                let item = cell.lock();
                self.pending.write().remove(&item.pending_key());
                removed += 1;
            }
        }

        tracing::info!(alert_id = %alert_id, removed, "Purged queue items for alert");
        Ok(removed)
    }

    /// Delete terminal items created before `cutoff`. Pending and processing
    /// items are never touched, whatever their age.
    pub(crate) fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        // Terminal items never change again, so once seen they stay eligible
        let expired: Vec<QueueItemId> = self
            .snapshot_cells()
            .iter()
            .filter_map(|cell| {
                let item = cell.lock();
                (item.status.is_terminal() && item.created_at < cutoff).then_some(item.id)
            })
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        self.write_ahead(|| JournalEntry::QueueItemsDeleted {
            ids: expired.clone(),
        })?;

        let removed = expired
            .iter()
            .filter(|id| self.items.remove(id).is_some())
            .count();

        Ok(removed)
    }

    /// Drop an item enqueued for an alert that disappeared mid-enqueue
    fn discard(&self, id: QueueItemId) {
        if let Err(e) = self.write_ahead(|| JournalEntry::QueueItemsDeleted { ids: vec![id] }) {
            tracing::warn!(item_id = %id, error = %e, "Discarding orphaned item without journal record");
        }
        if let Some((_, cell)) = self.items.remove(&id) {
            let item = cell.lock();
            self.pending.write().remove(&item.pending_key());
        }
    }

    pub(super) fn cell(&self, id: &QueueItemId) -> Option<Arc<Mutex<QueueItem>>> {
        self.items.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Clone out the item handles so no map shard lock is held while items are locked
    pub(super) fn snapshot_cells(&self) -> Vec<Arc<Mutex<QueueItem>>> {
        self.items
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(super) fn write_ahead<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce() -> JournalEntry,
    {
        if let Some(journal) = &self.journal {
            journal.append(&entry()).map_err(|e| {
                tracing::warn!(error = %e, "Journal append failed");
                CoreError::from(e)
            })?;
        }
        Ok(())
    }
}
