use std::time::Duration;

/// Queue behaviour knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts allowed per item before it is failed (default: 3)
    pub max_attempts: u32,
    /// Priority used when the caller gives none (default: 5)
    pub default_priority: i32,
    /// How long a claim stays valid without a report (default: 5 minutes).
    /// `None` disables lease expiry.
    pub lease_ttl: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_priority: 5,
            lease_ttl: Some(Duration::from_secs(300)),
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub(crate) fn chrono_lease_ttl(&self) -> Option<chrono::Duration> {
        self.lease_ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
    }
}
