//! Breach streak tracking and trigger resolution

pub mod ledger;
pub mod types;

pub use ledger::{Observation, TriggerLedger};
pub use types::{FixedSeverity, ResolutionKind, Severity, SeverityPolicy, Trigger, TriggerId};
