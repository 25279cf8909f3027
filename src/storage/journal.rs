//! Write-ahead journal for alert, queue, trigger and metric mutations
//!
//! Every mutation is appended as one JSON line before it becomes visible in
//! memory. Replaying the journal rebuilds the last known state of each record.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::alerts::{Alert, AlertId};
use crate::metrics::{Metric, MetricId};
use crate::queue::{QueueItem, QueueItemId};
use crate::triggers::{Trigger, TriggerId};

/// A single durable mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Full definition of an alert after create or update
    Alert { alert: Alert },
    AlertRemoved { id: AlertId },
    /// Full state of one queue item after a mutation
    QueueItem { item: QueueItem },
    /// Items assigned to a worker by one claim call
    ClaimBatch { items: Vec<QueueItem> },
    QueueItemsDeleted { ids: Vec<QueueItemId> },
    Trigger { trigger: Trigger },
    Metric { metric: Metric },
    /// All metrics created strictly before `before` were purged
    MetricsExpired { before: DateTime<Utc> },
}

/// Append-only sink for journal entries
pub trait Journal: Send + Sync {
    /// Durably record an entry. Callers must not apply the mutation if this fails.
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Flush buffered entries to stable storage
    fn sync(&self) -> Result<(), JournalError>;
}

/// JSON-lines journal backed by a single file
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileJournal {
    /// Open (or create) the journal file for appending
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild state from a journal file. A missing file yields an empty state.
    ///
    /// A torn final line (crash mid-append) is dropped; corruption anywhere
    /// else is an error.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<RecoveredState, JournalError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(RecoveredState::default());
        }

        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len();

        let mut state = RecoveredState::default();
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => state.apply(entry),
                Err(e) if idx + 1 == last => {
                    tracing::warn!(
                        line = idx + 1,
                        error = %e,
                        "Dropping torn journal tail"
                    );
                }
                Err(e) => {
                    return Err(JournalError::Corrupted(format!("line {}: {}", idx + 1, e)));
                }
            }
        }

        tracing::info!(
            alerts = state.alerts.len(),
            queue_items = state.queue_items.len(),
            triggers = state.triggers.len(),
            metrics = state.metrics.len(),
            "Replayed journal {}",
            path.display()
        );

        Ok(state)
    }
}

impl Journal for FileJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<(), JournalError> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// In-memory journal, used in tests to observe and inject storage failures
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    failing: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(JournalError::Unavailable("journal marked failing".into()));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn sync(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Records rebuilt from a journal
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub alerts: HashMap<AlertId, Alert>,
    pub queue_items: HashMap<QueueItemId, QueueItem>,
    pub triggers: HashMap<TriggerId, Trigger>,
    pub metrics: HashMap<MetricId, Metric>,
}

impl RecoveredState {
    pub fn from_entries(entries: impl IntoIterator<Item = JournalEntry>) -> Self {
        let mut state = Self::default();
        for entry in entries {
            state.apply(entry);
        }
        state
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Alert { alert } => {
                self.alerts.insert(alert.id, alert);
            }
            JournalEntry::AlertRemoved { id } => {
                self.alerts.remove(&id);
            }
            JournalEntry::QueueItem { item } => {
                self.queue_items.insert(item.id, item);
            }
            JournalEntry::ClaimBatch { items } => {
                for item in items {
                    self.queue_items.insert(item.id, item);
                }
            }
            JournalEntry::QueueItemsDeleted { ids } => {
                for id in ids {
                    self.queue_items.remove(&id);
                }
            }
            JournalEntry::Trigger { trigger } => {
                self.triggers.insert(trigger.id, trigger);
            }
            JournalEntry::Metric { metric } => {
                self.metrics.insert(metric.id, metric);
            }
            JournalEntry::MetricsExpired { before } => {
                self.metrics.retain(|_, m| m.created_at >= before);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted journal: {0}")]
    Corrupted(String),

    #[error("Journal unavailable: {0}")]
    Unavailable(String),
}
