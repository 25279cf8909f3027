//! Tripwire: alert evaluation scheduling and worker coordination
//!
//! Decides when an alert's condition should be re-checked, hands each unit of
//! work to exactly one worker at a time, tracks consecutive threshold breaches
//! and reports queue health.
//!
//! # Features
//!
//! - **Lock-skipping claims**: concurrent workers receive disjoint batches in
//!   priority, then scheduled-time order, without waiting on each other
//! - **Bounded retries**: transient failures re-queue until `max_attempts`
//! - **Lease expiry**: items held by a silent worker return to the pool
//! - **Breach ledger**: consecutive-breach streaks with automatic, manual and
//!   timeout resolution
//! - **Health snapshots**: queue size, lag, throughput and error rate
//! - **Retention**: terminal queue items and old metrics are swept on a timer
//! - **Write-ahead journal**: optional JSON-lines durability with replay
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripwire::alerts::{Alert, ComparisonOp, InMemoryAlertRegistry, MetricKind};
//! use tripwire::queue::{EvaluationKind, EvaluationQueue, Outcome, QueueConfig, WorkerLeaseManager};
//!
//! let registry = Arc::new(InMemoryAlertRegistry::new());
//! let alert_id = registry
//!     .create(Alert::new("ops", MetricKind::ResponseTime, ComparisonOp::GreaterThan, 500.0))
//!     .unwrap();
//!
//! let queue = Arc::new(EvaluationQueue::new(registry, QueueConfig::default()));
//! let leases = WorkerLeaseManager::new(Arc::clone(&queue));
//!
//! queue.enqueue(alert_id, EvaluationKind::Manual).unwrap();
//! for item in leases.claim_batch(10, "worker-1").unwrap() {
//!     let outcome = Outcome::Success { result: serde_json::json!({ "p95_ms": 420 }) };
//!     queue.report_outcome(item.id, "worker-1", outcome).unwrap();
//! }
//! ```

pub mod alerts;
pub mod api;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod triggers;

// Re-export commonly used types
pub use alerts::{Alert, AlertId, AlertRegistry, InMemoryAlertRegistry};
pub use error::{CoreError, Result};
pub use metrics::{HealthMonitor, HealthSnapshot, MetricsRecorder};
pub use queue::{EvaluationQueue, Outcome, QueueItem, QueueStatus, WorkerLeaseManager};
pub use triggers::{Trigger, TriggerLedger};
