//! Broker collaborator.
//!
//! The engine only needs four operations and at-least-once delivery: an
//! attempt that is dequeued but neither acked nor nacked before its
//! visibility timeout is delivered again.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::engine::DueQueue;
use crate::error::EngineError;
use crate::task::TaskAttempt;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Make `attempt` deliverable after `delay`.
    async fn enqueue(&self, attempt: TaskAttempt, delay: Duration) -> Result<(), EngineError>;

    /// Wait for the next deliverable attempt.
    async fn dequeue(&self) -> Result<TaskAttempt, EngineError>;

    async fn ack(&self, attempt_id: &str) -> Result<(), EngineError>;

    /// Give a delivered attempt back for immediate redelivery.
    async fn nack(&self, attempt_id: &str) -> Result<(), EngineError>;
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<TaskAttempt>,
    delayed: DueQueue<TaskAttempt>,
    in_flight: HashMap<String, (TaskAttempt, Instant)>,
    closed: bool,
}

impl Queue {
    /// Move due delayed attempts and expired deliveries to the ready queue.
    fn promote(&mut self, now: Instant) {
        while let Some(attempt) = self.delayed.pop_due(now) {
            self.ready.push_back(attempt);
        }
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((attempt, _)) = self.in_flight.remove(&id) {
                warn!("Visibility timeout expired for '{}', redelivering", id);
                self.ready.push_back(attempt);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let visibility = self.in_flight.values().map(|(_, deadline)| *deadline).min();
        match (self.delayed.next_due(), visibility) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process broker for tests and single-node deployments.
pub struct MemoryTransport {
    queue: Mutex<Queue>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Refuse further traffic and wake every blocked consumer.
    pub fn close(&self) {
        self.queue.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Attempts waiting to be delivered, delayed ones included.
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock().unwrap();
        queue.ready.len() + queue.delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.lock().unwrap().in_flight.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn enqueue(&self, attempt: TaskAttempt, delay: Duration) -> Result<(), EngineError> {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.closed {
                return Err(EngineError::TransportUnavailable(
                    "transport is closed".to_string(),
                ));
            }
            debug!("Enqueueing '{}' (delay {:?})", attempt.id, delay);
            if delay.is_zero() {
                queue.ready.push_back(attempt);
            } else {
                queue.delayed.push(Instant::now() + delay, attempt);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<TaskAttempt, EngineError> {
        loop {
            // Registered before the queue is inspected so a close() in
            // between is not missed.
            let notified = self.notify.notified();
            let wake = {
                let mut queue = self.queue.lock().unwrap();
                if queue.closed {
                    return Err(EngineError::TransportUnavailable(
                        "transport is closed".to_string(),
                    ));
                }
                let now = Instant::now();
                queue.promote(now);
                if let Some(attempt) = queue.ready.pop_front() {
                    queue.in_flight.insert(
                        attempt.id.clone(),
                        (attempt.clone(), now + self.visibility_timeout),
                    );
                    return Ok(attempt);
                }
                queue.next_wake()
            };

            match wake {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, attempt_id: &str) -> Result<(), EngineError> {
        if self.queue.lock().unwrap().in_flight.remove(attempt_id).is_none() {
            debug!("Ack for '{}' which is not in flight", attempt_id);
        }
        Ok(())
    }

    async fn nack(&self, attempt_id: &str) -> Result<(), EngineError> {
        {
            let mut queue = self.queue.lock().unwrap();
            match queue.in_flight.remove(attempt_id) {
                Some((attempt, _)) => queue.ready.push_back(attempt),
                None => {
                    debug!("Nack for '{}' which is not in flight", attempt_id);
                    return Ok(());
                }
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}
