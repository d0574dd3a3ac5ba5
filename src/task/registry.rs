//! Task registry.
//!
//! Maps task kinds to their executable bodies and static policies. The
//! registry is built once at startup and handed to the engine behind an
//! `Arc`; there is no way to register anything after that point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::retry::RetryPolicy;
use super::Task;
use crate::error::EngineError;

/// Per-attempt delay override: `(attempt, computed_delay) -> delay`.
/// Returning `None` keeps the computed delay.
pub type BackoffOverride = Arc<dyn Fn(u32, Duration) -> Option<Duration> + Send + Sync>;

/// Static policy attached to a task kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPolicy {
    /// Default retry policy for steps of this kind that do not declare one.
    pub retry: RetryPolicy,
    /// Per-attempt execution limit.
    pub timeout: Option<Duration>,
}

impl TaskPolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }
}

/// A registered task entry.
#[derive(Clone)]
pub struct RegisteredTask {
    pub task: Arc<dyn Task>,
    pub policy: TaskPolicy,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
    overrides: HashMap<String, BackoffOverride>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task body under `kind`.
    ///
    /// Fails with `DuplicateKind` if `kind` is already taken; the first
    /// definition stays authoritative.
    pub fn register<T: Task + 'static>(
        &mut self,
        kind: impl Into<String>,
        task: T,
        policy: TaskPolicy,
    ) -> Result<(), EngineError> {
        let kind = kind.into();
        if self.tasks.contains_key(&kind) {
            return Err(EngineError::DuplicateKind(kind));
        }
        debug!("Registering task kind '{}'", kind);
        self.tasks.insert(
            kind,
            RegisteredTask {
                task: Arc::new(task),
                policy,
            },
        );
        Ok(())
    }

    /// Register a named delay override that retry policies can refer to.
    pub fn register_backoff_override<F>(
        &mut self,
        id: impl Into<String>,
        delay: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(u32, Duration) -> Option<Duration> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.overrides.contains_key(&id) {
            return Err(EngineError::DuplicateKind(id));
        }
        self.overrides.insert(id, Arc::new(delay));
        Ok(())
    }

    pub fn resolve(&self, kind: &str) -> Result<&RegisteredTask, EngineError> {
        self.tasks
            .get(kind)
            .ok_or_else(|| EngineError::UnknownKind(kind.to_string()))
    }

    pub fn backoff_override(&self, id: &str) -> Option<&BackoffOverride> {
        self.overrides.get(id)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.tasks.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
