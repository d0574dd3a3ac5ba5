use crate::task::{Task, TaskError, TaskInput};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use std::time::Duration;

/// A simple example task to demonstrate the Task trait.
///
/// It fails (retryably) on its first `fail_attempts` attempts and then
/// reports `"<name> completed"` together with whatever it received upstream.
pub struct ExampleTask {
    pub name: String,
    pub fail_attempts: u32,
    pub work: Duration,
}

impl ExampleTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_attempts: 0,
            work: Duration::from_millis(100),
        }
    }

    pub fn failing(mut self, attempts: u32) -> Self {
        self.fail_attempts = attempts;
        self
    }
}

#[async_trait]
impl Task for ExampleTask {
    async fn execute(&self, input: TaskInput) -> Result<Value, TaskError> {
        info!("Executing {} (attempt {})", self.name, input.attempt);
        // Simulate some asynchronous work.
        tokio::time::sleep(self.work).await;
        if input.attempt <= self.fail_attempts {
            return Err(TaskError::retryable(format!(
                "{} failed on attempt {}",
                self.name, input.attempt
            )));
        }
        Ok(json!({
            "task": self.name,
            "payload": input.payload,
            "upstream": input.upstream,
        }))
    }
}

/// Collects the results it receives, standing in for a write to an external
/// system.
pub struct WriteResults {
    pub target: String,
}

#[async_trait]
impl Task for WriteResults {
    async fn execute(&self, input: TaskInput) -> Result<Value, TaskError> {
        let results = input.upstream.unwrap_or(Value::Null);
        info!("Writing results to {}: {}", self.target, results);
        Ok(json!({ "stored_in": self.target, "results": results }))
    }
}
