//! Evaluation work queue and the worker claim protocol

pub mod config;
pub mod item;
pub mod lease;
pub mod store;

pub use config::QueueConfig;
pub use item::{EvaluationKind, Outcome, PendingKey, QueueItem, QueueItemId, QueueStatus, LEASE_EXPIRED};
pub use lease::{ReclaimReport, WorkerLeaseManager};
pub use store::{EnqueueOptions, EvaluationQueue, QueueCounts};
