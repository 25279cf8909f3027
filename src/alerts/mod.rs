//! Alert definitions and the registry the coordination core reads them from.

pub mod config;
pub mod registry;

pub use config::{
    Alert, AlertId, ComparisonOp, MetricKind, NotificationFormat, NotificationFrequency,
    NotificationPolicy, QuietHours,
};
pub use registry::{AccessPolicy, AlertRegistry, AllowAll, InMemoryAlertRegistry, OwnerOnly};
