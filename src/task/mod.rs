use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::time::Duration;

use crate::engine::NodeState;

pub mod example_task;
pub mod registry;
pub mod retry;
pub mod runner;

#[cfg(test)]
mod tests;

pub use registry::{BackoffOverride, RegisteredTask, TaskPolicy, TaskRegistry};
pub use retry::{BackoffKind, RetryPolicy};
pub use runner::{Decision, Outcome, TaskRunner};

/// An opaque task body. The engine only sees its declared input and output.
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self, input: TaskInput) -> Result<Value, TaskError>;
}

/// What a task body receives for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// The payload declared on the task step.
    pub payload: Value,
    /// Output of the previous chain step, or the ordered group results for a
    /// chord callback.
    pub upstream: Option<Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub idempotency_key: String,
}

/// Failure reported by a task body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<Box<dyn Error + Send + Sync>> for TaskError {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        TaskError::retryable(err.to_string())
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::retryable(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::retryable(message)
    }
}

/// A fully resolved task step. Immutable once its workflow starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub input: Value,
    pub retry: RetryPolicy,
    pub idempotency_key: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// One execution attempt of a task step, as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub spec: TaskSpec,
    /// 1-based.
    pub number: u32,
    pub state: NodeState,
    pub scheduled_at: DateTime<Utc>,
    pub upstream: Option<Value>,
}

impl TaskAttempt {
    pub fn attempt_id(workflow_id: &str, node_id: &str, number: u32) -> String {
        format!("{}/{}/{}", workflow_id, node_id, number)
    }

    pub fn input(&self) -> TaskInput {
        TaskInput {
            payload: self.spec.input.clone(),
            upstream: self.upstream.clone(),
            attempt: self.number,
            idempotency_key: self.spec.idempotency_key.clone(),
        }
    }
}

/// Diagnostic history of one attempt, kept per node and copied into
/// dead-letter entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub state: NodeState,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Delay chosen before the next attempt, when this one was retried.
    pub retry_delay: Option<Duration>,
    pub cause: Option<String>,
}

impl AttemptRecord {
    pub fn scheduled(number: u32, at: DateTime<Utc>) -> Self {
        Self {
            number,
            state: NodeState::Pending,
            scheduled_at: at,
            started_at: None,
            finished_at: None,
            retry_delay: None,
            cause: None,
        }
    }
}
