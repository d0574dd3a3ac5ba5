//! Durable state collaborators.
//!
//! The engine persists node transitions through [`StateStore`] only; values
//! are JSON documents stored under string keys.

use async_trait::async_trait;

use crate::error::EngineError;

pub mod implementations;
pub use implementations::*;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepare the backend (create tables, ...).
    async fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError>;

    /// Write `new` only if the current value equals `expected`, where `None`
    /// means the key must be absent. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, EngineError>;
}

/// Key of a workflow's header record.
pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflow/{}", workflow_id)
}

/// Key of one node record of a workflow.
pub fn node_key(workflow_id: &str, node_id: &str) -> String {
    format!("workflow/{}/node/{}", workflow_id, node_id)
}
