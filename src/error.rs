//! Error types for the orchestration engine.

/// Unified error type for engine operations and collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A task kind was looked up but never registered.
    #[error("Unknown task kind: '{0}'")]
    UnknownKind(String),
    /// A task kind (or backoff override) was registered twice.
    #[error("Duplicate task kind: '{0}'")]
    DuplicateKind(String),
    /// The declarative workflow could not be turned into a plan.
    #[error("Invalid composition: {0}")]
    InvalidComposition(String),
    /// A gated node was committed before all of its preconditions succeeded.
    #[error("Preconditions not met for node '{node}': {missing:?}")]
    PreconditionNotMet { node: String, missing: Vec<String> },
    /// A task used up its retry budget.
    #[error("Task '{kind}' exhausted its retries after {attempts} attempt(s): {cause}")]
    RetriesExhausted {
        kind: String,
        attempts: u32,
        cause: String,
    },
    /// The broker collaborator could not be reached or was closed.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    /// A compare-and-swap lost against a concurrent writer.
    #[error("Persistence conflict on key '{0}'")]
    PersistenceConflict(String),
    /// Cancellation of a workflow that already finished.
    #[error("Workflow '{0}' is already terminal")]
    AlreadyTerminal(String),
    /// No live workflow with this id (never submitted, or archived).
    #[error("Unknown workflow: '{0}'")]
    UnknownWorkflow(String),
    /// Backend-specific storage failure.
    #[error("Storage error: {0}")]
    Storage(String),
    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The scheduler loop has shut down.
    #[error("Engine stopped")]
    EngineStopped,
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}
