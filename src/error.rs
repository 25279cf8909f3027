//! Error taxonomy shared by the queue, ledger, recorder and registry.

use std::fmt;

use uuid::Uuid;

use crate::storage::JournalError;

/// The kind of record a lookup failed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Alert,
    QueueItem,
    Trigger,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Alert => write!(f, "alert"),
            RecordKind::QueueItem => write!(f, "queue item"),
            RecordKind::Trigger => write!(f, "trigger"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: Uuid },

    #[error("Invalid transition for '{id}': {reason}")]
    InvalidTransition { id: Uuid, reason: String },

    /// The item has been moved to `failed`; `last_error` is what the worker reported.
    #[error("Queue item '{id}' exhausted its {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    pub fn not_found(kind: RecordKind, id: Uuid) -> Self {
        CoreError::NotFound { kind, id }
    }

    pub fn invalid_transition(id: Uuid, reason: impl Into<String>) -> Self {
        CoreError::InvalidTransition {
            id,
            reason: reason.into(),
        }
    }
}

impl From<JournalError> for CoreError {
    fn from(err: JournalError) -> Self {
        CoreError::StorageFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
