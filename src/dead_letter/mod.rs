//! Dead-letter routing for tasks that ran out of attempts.
//!
//! Entries are append-only. Routing the same task twice (e.g. after a
//! redelivery from the transport) writes it once, keyed by the task's
//! idempotency key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::task::{AttemptRecord, TaskSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub idempotency_key: String,
    pub workflow_id: String,
    pub node_id: String,
    /// Snapshot of the task as it was dispatched.
    pub spec: TaskSpec,
    pub attempts: Vec<AttemptRecord>,
    pub cause: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable, append-only terminal failure store.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, entry: DeadLetterEntry) -> Result<(), EngineError>;

    /// Entries of `kind` enqueued within `[from, to]`, oldest first.
    async fn query(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, EngineError>;
}

pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
    /// Routed idempotency keys, mapped to their workflow.
    routed: Mutex<HashMap<String, String>>,
}

impl DeadLetterRouter {
    pub fn new(sink: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            sink,
            routed: Mutex::new(HashMap::new()),
        }
    }

    /// Route an exhausted task to the sink.
    ///
    /// Returns `Ok(false)` without writing when an entry with the same
    /// idempotency key was already routed.
    pub async fn route(&self, entry: DeadLetterEntry) -> Result<bool, EngineError> {
        let key = entry.idempotency_key.clone();
        {
            let mut routed = self.routed.lock().unwrap();
            if routed.contains_key(&key) {
                debug!("Dead letter for '{}' already routed, ignoring", key);
                return Ok(false);
            }
            routed.insert(key.clone(), entry.workflow_id.clone());
        }

        warn!(
            "Dead-lettering task '{}' of workflow '{}' (node '{}'): {}",
            entry.spec.kind, entry.workflow_id, entry.node_id, entry.cause
        );
        if let Err(e) = self.sink.write(entry).await {
            error!("Failed to write dead letter '{}': {}", key, e);
            // let a later delivery try again
            self.routed.lock().unwrap().remove(&key);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop the routed keys of an archived workflow.
    pub fn forget(&self, workflow_id: &str) {
        self.routed
            .lock()
            .unwrap()
            .retain(|_, owner| owner != workflow_id);
    }

    pub async fn query(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        self.sink.query(kind, from, to).await
    }
}
