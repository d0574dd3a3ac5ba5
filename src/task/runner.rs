//! Executes one task attempt and turns its outcome into a retry decision.
//!
//! The runner keeps no state between attempts: it returns a [`Decision`] by
//! value and the scheduler acts on it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, warn};
use serde_json::Value;

use super::registry::TaskRegistry;
use super::{TaskAttempt, TaskError, TaskSpec};

/// What a task body produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure { cause: String, retryable: bool },
}

impl From<Result<Value, TaskError>> for Outcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failure {
                cause: e.message,
                retryable: e.retryable,
            },
        }
    }
}

/// What the scheduler should do next with the node.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Success(Value),
    Retry { delay: Duration, cause: String },
    Exhausted { cause: String },
}

#[derive(Clone)]
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
}

impl TaskRunner {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, attempt: &TaskAttempt) -> Decision {
        let outcome = self.run_body(attempt).await;
        self.decide(&attempt.spec, attempt.number, outcome)
    }

    async fn run_body(&self, attempt: &TaskAttempt) -> Outcome {
        let registered = match self.registry.resolve(&attempt.spec.kind) {
            Ok(registered) => registered,
            Err(e) => {
                return Outcome::Failure {
                    cause: e.to_string(),
                    retryable: false,
                }
            }
        };

        debug!(
            "Running '{}' for node '{}' (attempt {})",
            attempt.spec.kind, attempt.node_id, attempt.number
        );

        let body = AssertUnwindSafe(registered.task.execute(attempt.input())).catch_unwind();
        let timeout = attempt.spec.timeout.or(registered.policy.timeout);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::Failure {
                        cause: format!("attempt timed out after {:?}", limit),
                        retryable: true,
                    }
                }
            },
            None => body.await,
        };

        match result {
            Ok(result) => result.into(),
            Err(_) => {
                warn!(
                    "Task '{}' panicked on node '{}'",
                    attempt.spec.kind, attempt.node_id
                );
                Outcome::Failure {
                    cause: "task panicked".to_string(),
                    retryable: true,
                }
            }
        }
    }

    /// Pure retry decision for failed or successful attempt `attempt`.
    pub fn decide(&self, spec: &TaskSpec, attempt: u32, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success(value) => Decision::Success(value),
            Outcome::Failure { cause, retryable } => {
                if retryable && spec.retry.allows_retry_after(attempt) {
                    Decision::Retry {
                        delay: self.next_delay(spec, attempt),
                        cause,
                    }
                } else {
                    Decision::Exhausted { cause }
                }
            }
        }
    }

    fn next_delay(&self, spec: &TaskSpec, attempt: u32) -> Duration {
        let computed = spec.retry.delay_for(attempt);
        let overridden = spec
            .retry
            .delay_override
            .as_deref()
            .and_then(|id| match self.registry.backoff_override(id) {
                Some(f) => f(attempt, computed),
                None => {
                    warn!("Backoff override '{}' is not registered", id);
                    None
                }
            });
        overridden.map_or(computed, |d| d.min(spec.retry.max_delay))
    }
}
