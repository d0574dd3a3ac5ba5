//! The scheduler event loop.
//!
//! One task owns every live [`WorkflowInstance`] and is the only place node
//! state changes. Callers and workers talk to it over a channel, so two
//! group members finishing at the same time are applied one after the other.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::composer::Composer;
use super::definition::WorkflowSpec;
use super::due_queue::DueQueue;
use super::instance::{Effect, NodeRecord, WorkflowHeader, WorkflowInstance, WorkflowStatus};
use super::options::EngineOptions;
use super::plan::NodeId;
use crate::dead_letter::{DeadLetterEntry, DeadLetterRouter};
use crate::error::EngineError;
use crate::storage::{node_key, workflow_key, StateStore};
use crate::task::{Decision, TaskRegistry};
use crate::transport::Transport;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(crate) enum Command {
    Submit {
        spec: WorkflowSpec,
        reply: Reply<String>,
    },
    Status {
        id: String,
        reply: Reply<WorkflowStatus>,
    },
    Cancel {
        id: String,
        reply: Reply<()>,
    },
    Wait {
        id: String,
        reply: Reply<WorkflowStatus>,
    },
    Recover {
        id: String,
        reply: Reply<WorkflowStatus>,
    },
    /// A worker asks to run a delivered attempt.
    Claim {
        workflow_id: String,
        node_id: NodeId,
        attempt_id: String,
        reply: oneshot::Sender<bool>,
    },
    Outcome {
        workflow_id: String,
        node_id: NodeId,
        attempt_id: String,
        decision: Decision,
    },
    Shutdown,
}

struct Live {
    instance: WorkflowInstance,
    /// Last value written per store key, the expected side of the next CAS.
    versions: HashMap<String, String>,
    finished_at: Option<Instant>,
    /// Dead letters the sink refused, written again on every sweep.
    undelivered: Vec<DeadLetterEntry>,
}

pub(crate) struct Scheduler {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    dead_letters: Arc<DeadLetterRouter>,
    options: EngineOptions,
    workflows: HashMap<String, Live>,
    retries: DueQueue<(String, NodeId)>,
    waiters: HashMap<String, Vec<Reply<WorkflowStatus>>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        dead_letters: Arc<DeadLetterRouter>,
        options: EngineOptions,
    ) -> Self {
        Self {
            registry,
            store,
            transport,
            dead_letters,
            options,
            workflows: HashMap::new(),
            retries: DueQueue::new(),
            waiters: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let period = self.options.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next_retry = self.retries.next_due();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                _ = until(next_retry) => self.fire_due_retries().await,
                _ = sweep.tick() => {
                    self.redeliver_dead_letters().await;
                    self.sweep();
                }
            }
        }

        info!(
            "Scheduler stopped with {} live workflow(s), {} pending retry(ies)",
            self.workflows.len(),
            self.retries.len()
        );
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { spec, reply } => {
                let result = self.submit(spec).await;
                let _ = reply.send(result);
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.status(&id));
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(&id).await;
                let _ = reply.send(result);
            }
            Command::Wait { id, reply } => match self.workflows.get(&id) {
                Some(live) if live.instance.state().is_terminal() => {
                    let _ = reply.send(Ok(live.instance.status()));
                }
                Some(_) => self.waiters.entry(id).or_default().push(reply),
                None => {
                    let _ = reply.send(Err(EngineError::UnknownWorkflow(id)));
                }
            },
            Command::Recover { id, reply } => {
                let result = self.recover(&id).await;
                let _ = reply.send(result);
            }
            Command::Claim {
                workflow_id,
                node_id,
                attempt_id,
                reply,
            } => {
                let granted = match self.workflows.get_mut(&workflow_id) {
                    Some(live) => live.instance.claim(&node_id, &attempt_id),
                    None => false,
                };
                if granted {
                    self.apply(&workflow_id).await;
                }
                let _ = reply.send(granted);
            }
            Command::Outcome {
                workflow_id,
                node_id,
                attempt_id,
                decision,
            } => {
                let applied = match self.workflows.get_mut(&workflow_id) {
                    Some(live) => live.instance.record_decision(&node_id, &attempt_id, decision),
                    None => false,
                };
                if applied {
                    self.apply(&workflow_id).await;
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn submit(&mut self, spec: WorkflowSpec) -> Result<String, EngineError> {
        let id = Uuid::new_v4().to_string();
        let plan = Composer::new(&self.registry)
            .with_max_backoff(self.options.max_backoff)
            .compose(&spec, &id)?;

        let mut instance = WorkflowInstance::new(id.clone(), spec, plan);
        instance.start();
        self.workflows.insert(
            id.clone(),
            Live {
                instance,
                versions: HashMap::new(),
                finished_at: None,
                undelivered: Vec::new(),
            },
        );
        self.apply(&id).await;
        Ok(id)
    }

    fn status(&self, id: &str) -> Result<WorkflowStatus, EngineError> {
        self.workflows
            .get(id)
            .map(|live| live.instance.status())
            .ok_or_else(|| EngineError::UnknownWorkflow(id.to_string()))
    }

    async fn cancel(&mut self, id: &str) -> Result<(), EngineError> {
        match self.workflows.get_mut(id) {
            Some(live) => live.instance.cancel()?,
            None => return Err(EngineError::UnknownWorkflow(id.to_string())),
        }
        self.apply(id).await;
        Ok(())
    }

    /// Rebuild a workflow from the state store and continue it.
    async fn recover(&mut self, id: &str) -> Result<WorkflowStatus, EngineError> {
        if let Some(live) = self.workflows.get(id) {
            debug!("Workflow '{}' is live, nothing to recover", id);
            return Ok(live.instance.status());
        }

        let header_key = workflow_key(id);
        let raw_header = self
            .store
            .get(&header_key)
            .await?
            .ok_or_else(|| EngineError::UnknownWorkflow(id.to_string()))?;
        let header: WorkflowHeader = serde_json::from_str(&raw_header)?;
        let plan = Composer::new(&self.registry)
            .with_max_backoff(self.options.max_backoff)
            .compose(&header.spec, id)?;

        let mut versions = HashMap::new();
        versions.insert(header_key, raw_header);
        let mut records: HashMap<NodeId, NodeRecord> = HashMap::new();
        for node in plan.index.ids() {
            let key = node_key(id, node);
            if let Some(raw) = self.store.get(&key).await? {
                records.insert(node.clone(), serde_json::from_str(&raw)?);
                versions.insert(key, raw);
            }
        }
        info!(
            "Recovered workflow '{}' with {} persisted node record(s)",
            id,
            records.len()
        );

        let mut instance = WorkflowInstance::restore(header, plan, records);
        instance.resume();
        let finished_at = instance.state().is_terminal().then(Instant::now);
        self.workflows.insert(
            id.to_string(),
            Live {
                instance,
                versions,
                finished_at,
                undelivered: Vec::new(),
            },
        );
        self.apply(id).await;
        self.status(id)
    }

    async fn fire_due_retries(&mut self) {
        let now = Instant::now();
        while let Some((workflow_id, node)) = self.retries.pop_due(now) {
            match self.workflows.get_mut(&workflow_id) {
                Some(live) => live.instance.retry_due(&node),
                None => continue,
            }
            self.apply(&workflow_id).await;
        }
    }

    /// Archive finished workflows that outlived the retention window.
    /// A workflow with dead letters still to write stays live.
    fn sweep(&mut self) {
        let retention = self.options.retention;
        let now = Instant::now();
        let expired: Vec<String> = self
            .workflows
            .iter()
            .filter(|(_, live)| live.undelivered.is_empty())
            .filter(|(_, live)| matches!(live.finished_at, Some(at) if now - at >= retention))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            info!("Archiving workflow '{}'", id);
            self.workflows.remove(&id);
            self.waiters.remove(&id);
            self.dead_letters.forget(&id);
        }
    }

    async fn redeliver_dead_letters(&mut self) {
        for (id, live) in self.workflows.iter_mut() {
            if live.undelivered.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut live.undelivered);
            debug!(
                "Writing {} held dead letter(s) of workflow '{}'",
                pending.len(),
                id
            );
            for entry in pending {
                if let Err(e) = self.dead_letters.route(entry.clone()).await {
                    warn!("Dead letter for workflow '{}' still not stored: {}", id, e);
                    live.undelivered.push(entry);
                }
            }
        }
    }

    /// Carry out the effects queued by the last transition of workflow `id`.
    async fn apply(&mut self, id: &str) {
        let live = match self.workflows.get_mut(id) {
            Some(live) => live,
            None => return,
        };

        // Failing the workflow queues more effects; loop until none are left.
        loop {
            let effects = live.instance.take_effects();
            if effects.is_empty() {
                break;
            }
            // State is durable before anything it implies is dispatched.
            if let Err(e) = persist_effects(self.store.as_ref(), &self.options, live, &effects).await
            {
                error!("Failing workflow '{}': {}", id, e);
                live.instance.fail(e.to_string());
                // the store is what failed, the failure stays in memory only
                live.instance.take_effects();
                break;
            }
            for effect in effects {
                match effect {
                    Effect::Dispatch(attempt) => {
                        if live.instance.state().is_terminal() {
                            continue;
                        }
                        let attempt_id = attempt.id.clone();
                        if let Err(e) = self.transport.enqueue(attempt, Duration::ZERO).await {
                            error!("Could not enqueue '{}': {}", attempt_id, e);
                            live.instance.fail(e.to_string());
                        }
                    }
                    Effect::ScheduleRetry { node, delay } => {
                        self.retries
                            .push(Instant::now() + delay, (id.to_string(), node));
                    }
                    Effect::DeadLetter(entry) => {
                        if let Err(e) = self.dead_letters.route(entry.clone()).await {
                            error!(
                                "Dead letter for workflow '{}' was not stored, holding it: {}",
                                id, e
                            );
                            live.undelivered.push(entry);
                        }
                    }
                    Effect::Persist(_) | Effect::PersistHeader => {}
                }
            }
        }

        if live.instance.state().is_terminal() {
            if live.finished_at.is_none() {
                live.finished_at = Some(Instant::now());
            }
            if let Some(waiters) = self.waiters.remove(id) {
                let status = live.instance.status();
                for waiter in waiters {
                    let _ = waiter.send(Ok(status.clone()));
                }
            }
        }
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

async fn until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn persist_effects(
    store: &dyn StateStore,
    options: &EngineOptions,
    live: &mut Live,
    effects: &[Effect],
) -> Result<(), EngineError> {
    let id = live.instance.id().to_string();
    let mut written: HashSet<String> = HashSet::new();

    for effect in effects {
        let (key, value) = match effect {
            Effect::PersistHeader => (
                workflow_key(&id),
                serde_json::to_string(&live.instance.header())?,
            ),
            Effect::Persist(node) => match live.instance.node(node) {
                Some(record) => (node_key(&id, node), serde_json::to_string(record)?),
                None => continue,
            },
            _ => continue,
        };
        // records are read at write time, so one write per key is enough
        if !written.insert(key.clone()) {
            continue;
        }
        if live.versions.get(&key) == Some(&value) {
            continue;
        }
        persist(store, options, &mut live.versions, key, value).await?;
    }
    Ok(())
}

/// Compare-and-swap `value` into `key`, retrying with backoff.
///
/// A value written by someone else is never overwritten: the write only
/// succeeds against the version this scheduler last wrote.
async fn persist(
    store: &dyn StateStore,
    options: &EngineOptions,
    versions: &mut HashMap<String, String>,
    key: String,
    value: String,
) -> Result<(), EngineError> {
    let expected = versions.get(&key).cloned();
    let mut backoff = options.persist_backoff;

    for attempt in 0..=options.persist_retries {
        if store
            .compare_and_swap(&key, expected.as_deref(), value.clone())
            .await?
        {
            versions.insert(key, value);
            return Ok(());
        }
        if store.get(&key).await?.as_deref() == Some(value.as_str()) {
            versions.insert(key, value);
            return Ok(());
        }
        if attempt == options.persist_retries {
            break;
        }
        warn!(
            "Persistence conflict on '{}' (attempt {}), retrying in {:?}",
            key,
            attempt + 1,
            backoff
        );
        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_mul(2);
    }
    Err(EngineError::PersistenceConflict(key))
}

#[cfg(test)]
mod tests;
