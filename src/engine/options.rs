use serde::Deserialize;
use std::time::Duration;

use crate::task::retry::DEFAULT_MAX_BACKOFF;

/// Engine-wide settings. Deserializes from JSON with every field optional,
/// durations written as `{ "secs": 60, "nanos": 0 }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Number of worker loops pulling attempts from the transport
    pub workers: usize,
    /// Ceiling applied to every retry delay
    pub max_backoff: Duration,
    /// How long a finished workflow stays queryable
    pub retention: Duration,
    /// How often finished workflows are checked against `retention`
    pub sweep_interval: Duration,
    /// Compare-and-swap attempts before a write is a `PersistenceConflict`
    pub persist_retries: u32,
    /// Pause before the first CAS retry; doubles on each further retry
    pub persist_backoff: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            max_backoff: DEFAULT_MAX_BACKOFF,
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            persist_retries: 3,
            persist_backoff: Duration::from_millis(50),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, value: usize) -> Self {
        self.workers = value.max(1);
        self
    }

    pub fn with_max_backoff(mut self, value: Duration) -> Self {
        self.max_backoff = value;
        self
    }

    pub fn with_retention(mut self, value: Duration) -> Self {
        self.retention = value;
        self
    }

    pub fn with_sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = value;
        self
    }

    pub fn with_persist_retries(mut self, value: u32) -> Self {
        self.persist_retries = value;
        self
    }

    pub fn with_persist_backoff(mut self, value: Duration) -> Self {
        self.persist_backoff = value;
        self
    }
}
