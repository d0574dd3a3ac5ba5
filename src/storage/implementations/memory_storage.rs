use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::EngineError;
use crate::storage::StateStore;

/// In-memory implementation of StateStore for testing
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStateStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, without going through the async trait.
    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, EngineError> {
        let mut values = self.values.lock().unwrap();
        if values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        values.insert(key.to_string(), new);
        Ok(true)
    }
}

/// In-memory dead-letter sink. Keeps the first entry per idempotency key.
#[derive(Clone, Default)]
pub struct MemoryDeadLetterSink {
    entries: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&self, entry: DeadLetterEntry) -> Result<(), EngineError> {
        let mut entries = self.entries.lock().unwrap();
        if !entries
            .iter()
            .any(|e| e.idempotency_key == entry.idempotency_key)
        {
            entries.push(entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        let mut found: Vec<DeadLetterEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.spec.kind == kind && e.enqueued_at >= from && e.enqueued_at <= to)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.enqueued_at);
        Ok(found)
    }
}
