//! Background upkeep: retention, lease reclaim and scheduled enqueueing

pub mod retention;
pub mod scheduler;
pub mod worker;

pub use retention::{RetentionConfig, RetentionSweeper, SweepReport};
pub use scheduler::EvaluationScheduler;
pub use worker::MaintenanceWorker;
