//! Per-workflow state machine.
//!
//! A [`WorkflowInstance`] owns its plan and its node-state map. It never
//! performs I/O: every transition queues [`Effect`]s (dispatch an attempt,
//! park a retry, persist a node, dead-letter a task) that the scheduler
//! carries out. All mutation happens from the scheduler's single event loop.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::definition::WorkflowSpec;
use super::node_state::{NodeState, WorkflowState};
use super::plan::{IndexEntry, NodeId, Plan, Position, Shape};
use crate::dead_letter::DeadLetterEntry;
use crate::error::EngineError;
use crate::task::{AttemptRecord, Decision, TaskAttempt};

/// Persisted state of one plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub state: NodeState,
    /// Current attempt number (leaves only).
    pub attempt: u32,
    pub attempt_id: Option<String>,
    /// Upstream value received on activation.
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub cause: Option<String>,
    /// Failed, but best-effort, so the parent carried on.
    pub tolerated: bool,
    /// Chain: index of the step currently running.
    pub next_step: usize,
    /// Group/chord: members still outstanding.
    pub remaining: usize,
    pub failures: usize,
    pub joined: Vec<bool>,
    pub results: Vec<Value>,
    pub history: Vec<AttemptRecord>,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            state: NodeState::Blocked,
            attempt: 0,
            attempt_id: None,
            input: None,
            output: None,
            cause: None,
            tolerated: false,
            next_step: 0,
            remaining: 0,
            failures: 0,
            joined: Vec::new(),
            results: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Persisted workflow-level record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHeader {
    pub id: String,
    pub spec: WorkflowSpec,
    pub state: WorkflowState,
    pub first_failure: Option<NodeId>,
    pub fatal_cause: Option<String>,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    Dispatch(TaskAttempt),
    ScheduleRetry { node: NodeId, delay: Duration },
    DeadLetter(DeadLetterEntry),
    Persist(NodeId),
    PersistHeader,
}

#[derive(Debug, Clone)]
enum Step {
    Activate { node: NodeId, upstream: Option<Value> },
    /// The node reached a terminal state; tell its parent.
    Settled { node: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub attempts: u32,
    pub cause: Option<String>,
    pub tolerated: bool,
}

/// Diagnosis of a failed workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// First node that failed, if the failure came from a node.
    pub node: Option<NodeId>,
    pub cause: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub id: String,
    pub name: String,
    pub state: WorkflowState,
    pub nodes: BTreeMap<NodeId, NodeStatus>,
    pub result: Option<Value>,
    pub failure: Option<FailureReport>,
}

pub struct WorkflowInstance {
    id: String,
    spec: WorkflowSpec,
    plan: Plan,
    nodes: HashMap<NodeId, NodeRecord>,
    state: WorkflowState,
    first_failure: Option<NodeId>,
    fatal_cause: Option<String>,
    ready: VecDeque<Step>,
    effects: Vec<Effect>,
}

impl WorkflowInstance {
    pub fn new(id: impl Into<String>, spec: WorkflowSpec, plan: Plan) -> Self {
        let mut nodes: HashMap<NodeId, NodeRecord> = plan
            .index
            .ids()
            .iter()
            .map(|id| (id.clone(), NodeRecord::default()))
            .collect();
        if let Some(root) = nodes.get_mut(&plan.root.id) {
            root.state = NodeState::Pending;
        }
        Self {
            id: id.into(),
            spec,
            plan,
            nodes,
            state: WorkflowState::Running,
            first_failure: None,
            fatal_cause: None,
            ready: VecDeque::new(),
            effects: Vec::new(),
        }
    }

    /// Rebuild an instance from persisted records. Missing node records are
    /// treated as never activated.
    pub fn restore(
        header: WorkflowHeader,
        plan: Plan,
        mut records: HashMap<NodeId, NodeRecord>,
    ) -> Self {
        let mut instance = Self::new(header.id, header.spec, plan);
        for (id, record) in instance.nodes.iter_mut() {
            if let Some(stored) = records.remove(id) {
                *record = stored;
            }
        }
        instance.state = header.state;
        instance.first_failure = header.first_failure;
        instance.fatal_cause = header.fatal_cause;
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn node_state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|r| r.state)
    }

    pub fn node_ids(&self) -> &[NodeId] {
        self.plan.index.ids()
    }

    pub fn header(&self) -> WorkflowHeader {
        WorkflowHeader {
            id: self.id.clone(),
            spec: self.spec.clone(),
            state: self.state,
            first_failure: self.first_failure.clone(),
            fatal_cause: self.fatal_cause.clone(),
        }
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Activate the root node.
    pub fn start(&mut self) {
        info!("Starting workflow '{}' ({})", self.id, self.spec.name);
        self.effects.push(Effect::PersistHeader);
        for id in self.plan.index.ids().to_vec() {
            self.effects.push(Effect::Persist(id));
        }
        let root = self.plan.root.id.clone();
        self.ready.push_back(Step::Activate {
            node: root,
            upstream: None,
        });
        self.drain();
    }

    /// Grant a worker the right to run `attempt_id`.
    ///
    /// Only the node's current attempt, while still pending, can be claimed;
    /// this keeps at most one attempt per node running.
    pub fn claim(&mut self, node: &str, attempt_id: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let record = match self.nodes.get_mut(node) {
            Some(record) => record,
            None => return false,
        };
        if record.attempt_id.as_deref() != Some(attempt_id) || record.state != NodeState::Pending {
            debug!(
                "Refusing claim of '{}' (node '{}' is {})",
                attempt_id, node, record.state
            );
            return false;
        }
        record.state = NodeState::Running;
        if let Some(last) = record.history.last_mut() {
            last.state = NodeState::Running;
            last.started_at = Some(Utc::now());
        }
        self.effects.push(Effect::Persist(node.to_string()));
        true
    }

    /// Apply the runner's decision for a running attempt.
    ///
    /// Returns `false` (and changes nothing) for outcomes of attempts that are
    /// no longer current, e.g. after cancellation.
    pub fn record_decision(&mut self, node: &str, attempt_id: &str, decision: Decision) -> bool {
        if self.state.is_terminal() {
            debug!(
                "Discarding outcome of '{}': workflow '{}' is {}",
                attempt_id, self.id, self.state
            );
            return false;
        }
        let kind = match self.plan.index.get(node).and_then(|e| e.spec.as_ref()) {
            Some(spec) => spec.kind.clone(),
            None => return false,
        };
        let record = match self.nodes.get_mut(node) {
            Some(record) => record,
            None => return false,
        };
        if record.attempt_id.as_deref() != Some(attempt_id) || record.state != NodeState::Running {
            debug!("Discarding stale outcome of '{}'", attempt_id);
            return false;
        }

        let now = Utc::now();
        match decision {
            Decision::Success(value) => {
                info!("Node '{}' succeeded on attempt {}", node, record.attempt);
                record.state = NodeState::Succeeded;
                record.output = Some(value);
                record.cause = None;
                if let Some(last) = record.history.last_mut() {
                    last.state = NodeState::Succeeded;
                    last.finished_at = Some(now);
                }
                self.effects.push(Effect::Persist(node.to_string()));
                self.ready.push_back(Step::Settled {
                    node: node.to_string(),
                });
            }
            Decision::Retry { delay, cause } => {
                info!(
                    "Node '{}' failed attempt {} ({}), retrying in {:?}",
                    node, record.attempt, cause, delay
                );
                record.state = NodeState::Retrying;
                if let Some(last) = record.history.last_mut() {
                    last.state = NodeState::Retrying;
                    last.finished_at = Some(now);
                    last.retry_delay = Some(delay);
                    last.cause = Some(cause.clone());
                }
                record.cause = Some(cause);
                self.effects.push(Effect::Persist(node.to_string()));
                self.effects.push(Effect::ScheduleRetry {
                    node: node.to_string(),
                    delay,
                });
            }
            Decision::Exhausted { cause } => {
                let exhausted = EngineError::RetriesExhausted {
                    kind,
                    attempts: record.attempt,
                    cause: cause.clone(),
                };
                error!("Node '{}' failed: {}", node, exhausted);
                record.state = NodeState::Failed;
                record.cause = Some(exhausted.to_string());
                if let Some(last) = record.history.last_mut() {
                    last.state = NodeState::Failed;
                    last.finished_at = Some(now);
                    last.cause = Some(cause.clone());
                }
                if let Some(entry) = self.dead_letter(node, cause) {
                    self.effects.push(Effect::DeadLetter(entry));
                }
                self.effects.push(Effect::Persist(node.to_string()));
                self.ready.push_back(Step::Settled {
                    node: node.to_string(),
                });
            }
        }
        self.drain();
        true
    }

    /// A parked retry became due: dispatch the next attempt.
    pub fn retry_due(&mut self, node: &str) {
        if self.state.is_terminal() {
            return;
        }
        let next = match self.nodes.get(node) {
            Some(record) if record.state == NodeState::Retrying => record.attempt + 1,
            _ => return,
        };
        self.dispatch(node, next);
        self.drain();
    }

    /// Cancel the workflow: every unfinished node becomes `Cancelled` and
    /// nothing new is dispatched. Work already running is left to finish and
    /// its outcome is discarded.
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        if self.state.is_terminal() {
            return Err(EngineError::AlreadyTerminal(self.id.clone()));
        }
        info!("Cancelling workflow '{}'", self.id);
        for id in self.plan.index.ids().to_vec() {
            if let Some(record) = self.nodes.get_mut(&id) {
                if !record.state.is_terminal() {
                    record.state = NodeState::Cancelled;
                    self.effects.push(Effect::Persist(id));
                }
            }
        }
        self.ready.clear();
        self.state = WorkflowState::Cancelled;
        self.effects.push(Effect::PersistHeader);
        Ok(())
    }

    /// Fail the whole workflow for a reason outside the plan, such as a
    /// persistence conflict that could not be resolved.
    pub fn fail(&mut self, cause: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let cause = cause.into();
        error!("Workflow '{}' failed: {}", self.id, cause);
        for id in self.plan.index.ids().to_vec() {
            if let Some(record) = self.nodes.get_mut(&id) {
                if !record.state.is_terminal() {
                    record.state = NodeState::Cancelled;
                    self.effects.push(Effect::Persist(id));
                }
            }
        }
        self.ready.clear();
        self.fatal_cause = Some(cause);
        self.state = WorkflowState::Failed;
        self.effects.push(Effect::PersistHeader);
    }

    /// Pick up a restored instance where it left off.
    ///
    /// Composite progress comes from the persisted records; children that
    /// were about to be activated are activated, terminal children that were
    /// not yet joined are settled again, and leaves that were in flight are
    /// dispatched again.
    pub fn resume(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        info!("Resuming workflow '{}'", self.id);
        for id in self.plan.index.ids().to_vec() {
            let entry = match self.plan.index.get(&id) {
                Some(entry) => entry.clone(),
                None => continue,
            };
            let record = match self.nodes.get(&id) {
                Some(record) => record.clone(),
                None => continue,
            };

            if entry.parent.is_none() {
                if record.state == NodeState::Pending && record.attempt_id.is_none() {
                    self.ready.push_back(Step::Activate {
                        node: id.clone(),
                        upstream: None,
                    });
                    continue;
                }
                if record.state.is_terminal() {
                    self.ready.push_back(Step::Settled { node: id.clone() });
                    continue;
                }
            }

            match entry.shape {
                Shape::Leaf => match record.state {
                    NodeState::Pending | NodeState::Running if record.attempt > 0 => {
                        self.dispatch(&id, record.attempt)
                    }
                    NodeState::Retrying => self.dispatch(&id, record.attempt + 1),
                    _ => {}
                },
                Shape::Chain if record.state == NodeState::Running => {
                    let step = record.next_step;
                    if let Some(child) = entry.members.get(step) {
                        let upstream = if step == 0 {
                            record.input.clone()
                        } else {
                            self.nodes
                                .get(&entry.members[step - 1])
                                .and_then(|r| r.output.clone())
                        };
                        self.reconcile_child(child, upstream);
                    }
                }
                Shape::Group | Shape::Chord if record.state == NodeState::Running => {
                    for (i, child) in entry.members.iter().enumerate() {
                        if !record.joined.get(i).copied().unwrap_or(false) {
                            self.reconcile_child(child, record.input.clone());
                        }
                    }
                    if entry.shape == Shape::Chord && record.remaining == 0 && record.failures == 0 {
                        if let Some(callback) = &entry.callback {
                            self.reconcile_child(callback, Some(Value::Array(record.results.clone())));
                        }
                    }
                }
                _ => {}
            }
        }
        self.drain();
    }

    fn reconcile_child(&mut self, child: &str, upstream: Option<Value>) {
        match self.node_state(child) {
            Some(NodeState::Blocked) => self.ready.push_back(Step::Activate {
                node: child.to_string(),
                upstream,
            }),
            Some(state) if state.is_terminal() => self.ready.push_back(Step::Settled {
                node: child.to_string(),
            }),
            _ => {}
        }
    }

    pub fn status(&self) -> WorkflowStatus {
        let nodes = self
            .plan
            .index
            .ids()
            .iter()
            .filter_map(|id| {
                self.nodes.get(id).map(|r| {
                    (
                        id.clone(),
                        NodeStatus {
                            state: r.state,
                            attempts: r.attempt,
                            cause: r.cause.clone(),
                            tolerated: r.tolerated,
                        },
                    )
                })
            })
            .collect();

        let result = match self.state {
            WorkflowState::Succeeded | WorkflowState::PartiallyFailed => self
                .nodes
                .get(&self.plan.root.id)
                .and_then(|r| r.output.clone()),
            _ => None,
        };

        let failure = if self.state == WorkflowState::Failed {
            match (&self.first_failure, &self.fatal_cause) {
                (_, Some(cause)) => Some(FailureReport {
                    node: self.first_failure.clone(),
                    cause: cause.clone(),
                    attempts: self
                        .first_failure
                        .as_ref()
                        .and_then(|id| self.nodes.get(id))
                        .map(|r| r.history.clone())
                        .unwrap_or_default(),
                }),
                (Some(node), None) => self.nodes.get(node).map(|r| FailureReport {
                    node: Some(node.clone()),
                    cause: r.cause.clone().unwrap_or_default(),
                    attempts: r.history.clone(),
                }),
                (None, None) => None,
            }
        } else {
            None
        };

        WorkflowStatus {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            state: self.state,
            nodes,
            result,
            failure,
        }
    }

    fn drain(&mut self) {
        while let Some(step) = self.ready.pop_front() {
            if self.state.is_terminal() {
                self.ready.clear();
                break;
            }
            match step {
                Step::Activate { node, upstream } => self.activate(&node, upstream),
                Step::Settled { node } => self.settle(&node),
            }
        }
    }

    fn entry(&self, id: &str) -> Option<IndexEntry> {
        let entry = self.plan.index.get(id).cloned();
        if entry.is_none() {
            error!("Node '{}' is not part of workflow '{}'", id, self.id);
        }
        entry
    }

    fn record_mut(&mut self, id: &str) -> &mut NodeRecord {
        self.nodes.entry(id.to_string()).or_default()
    }

    fn activate(&mut self, id: &str, upstream: Option<Value>) {
        let entry = match self.entry(id) {
            Some(entry) => entry,
            None => return,
        };
        debug!("Activating node '{}' of workflow '{}'", id, self.id);

        match entry.shape {
            Shape::Leaf => {
                let admitted = {
                    let nodes = &self.nodes;
                    self.plan
                        .gate
                        .commit(id, |n| nodes.get(n).map(|r| r.state))
                };
                let record = self.record_mut(id);
                record.input = upstream;
                if let Err(refused) = admitted {
                    record.state = NodeState::Failed;
                    record.cause = Some(refused.to_string());
                    self.effects.push(Effect::Persist(id.to_string()));
                    self.ready.push_back(Step::Settled {
                        node: id.to_string(),
                    });
                    return;
                }
                self.dispatch(id, 1);
            }
            Shape::Chain => {
                let record = self.record_mut(id);
                record.state = NodeState::Running;
                record.input = upstream.clone();
                record.next_step = 0;
                self.effects.push(Effect::Persist(id.to_string()));
                if let Some(first) = entry.members.first() {
                    self.ready.push_back(Step::Activate {
                        node: first.clone(),
                        upstream,
                    });
                }
            }
            Shape::Group | Shape::Chord => {
                let width = entry.members.len();
                let record = self.record_mut(id);
                record.state = NodeState::Running;
                record.input = upstream.clone();
                record.remaining = width;
                record.failures = 0;
                record.joined = vec![false; width];
                record.results = vec![Value::Null; width];
                self.effects.push(Effect::Persist(id.to_string()));
                for member in &entry.members {
                    self.ready.push_back(Step::Activate {
                        node: member.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }
    }

    fn dispatch(&mut self, id: &str, number: u32) {
        let spec = match self.entry(id).and_then(|e| e.spec) {
            Some(spec) => spec,
            None => return,
        };
        let attempt_id = TaskAttempt::attempt_id(&self.id, id, number);
        let now = Utc::now();
        let workflow_id = self.id.clone();

        let record = self.record_mut(id);
        record.state = NodeState::Pending;
        record.attempt = number;
        record.attempt_id = Some(attempt_id.clone());
        // a redelivery after recovery keeps the attempt it repeats
        match record.history.last_mut() {
            Some(last) if last.number == number => {
                last.state = NodeState::Pending;
                last.started_at = None;
            }
            _ => record.history.push(AttemptRecord::scheduled(number, now)),
        }
        let upstream = record.input.clone();

        debug!("Dispatching '{}' ({})", attempt_id, spec.kind);
        self.effects.push(Effect::Persist(id.to_string()));
        self.effects.push(Effect::Dispatch(TaskAttempt {
            id: attempt_id,
            workflow_id,
            node_id: id.to_string(),
            spec,
            number,
            state: NodeState::Pending,
            scheduled_at: now,
            upstream,
        }));
    }

    fn dead_letter(&self, node: &str, cause: String) -> Option<DeadLetterEntry> {
        let spec = self.plan.index.get(node)?.spec.clone()?;
        let record = self.nodes.get(node)?;
        Some(DeadLetterEntry {
            idempotency_key: spec.idempotency_key.clone(),
            workflow_id: self.id.clone(),
            node_id: node.to_string(),
            spec,
            attempts: record.history.clone(),
            cause,
            enqueued_at: Utc::now(),
        })
    }

    fn settle(&mut self, id: &str) {
        let entry = match self.entry(id) {
            Some(entry) => entry,
            None => return,
        };
        let (state, input, output, cause) = match self.nodes.get(id) {
            Some(r) => (r.state, r.input.clone(), r.output.clone(), r.cause.clone()),
            None => return,
        };

        let succeeded = state == NodeState::Succeeded;
        let tolerated = !succeeded && entry.best_effort;
        let ok = succeeded || tolerated;
        let output = if succeeded {
            output.unwrap_or(Value::Null)
        } else {
            input.unwrap_or(Value::Null)
        };

        if tolerated {
            warn!(
                "Best-effort node '{}' failed, continuing: {}",
                id,
                cause.as_deref().unwrap_or("unknown cause")
            );
            let record = self.record_mut(id);
            record.tolerated = true;
            record.output = Some(output.clone());
            self.effects.push(Effect::Persist(id.to_string()));
        } else if !succeeded
            && entry.shape == Shape::Leaf
            && self.first_failure.is_none()
            && !self.tolerated_above(id)
        {
            self.first_failure = Some(id.to_string());
        }

        let parent_id = match &entry.parent {
            Some(parent) => parent.clone(),
            None => {
                self.finish(ok);
                return;
            }
        };
        let parent = match self.entry(&parent_id) {
            Some(parent) => parent,
            None => return,
        };
        let cause = cause.unwrap_or_else(|| format!("node '{}' failed", id));

        match (parent.shape, entry.position) {
            (Shape::Chain, Position::Member(i)) => {
                if !ok {
                    for later in &parent.members[i + 1..] {
                        self.skip(later);
                    }
                    self.complete(&parent_id, NodeState::Failed, None, Some(cause));
                } else if let Some(next) = parent.members.get(i + 1) {
                    self.record_mut(&parent_id).next_step = i + 1;
                    self.effects.push(Effect::Persist(parent_id.clone()));
                    self.ready.push_back(Step::Activate {
                        node: next.clone(),
                        upstream: Some(output),
                    });
                } else {
                    self.complete(&parent_id, NodeState::Succeeded, Some(output), None);
                }
            }
            (Shape::Group, Position::Member(i)) | (Shape::Chord, Position::Member(i)) => {
                let record = self.record_mut(&parent_id);
                if record.joined.get(i).copied().unwrap_or(true) {
                    return;
                }
                record.joined[i] = true;
                record.results[i] = output;
                record.remaining = record.remaining.saturating_sub(1);
                if !ok {
                    record.failures += 1;
                }
                let (remaining, failures, results) =
                    (record.remaining, record.failures, record.results.clone());
                self.effects.push(Effect::Persist(parent_id.clone()));
                if remaining > 0 {
                    return;
                }

                if failures == 0 {
                    match (parent.shape, &parent.callback) {
                        (Shape::Chord, Some(callback)) => {
                            self.ready.push_back(Step::Activate {
                                node: callback.clone(),
                                upstream: Some(Value::Array(results)),
                            });
                        }
                        _ => self.complete(
                            &parent_id,
                            NodeState::Succeeded,
                            Some(Value::Array(results)),
                            None,
                        ),
                    }
                } else {
                    let first = self.first_failed_member(&parent.members);
                    let mut cause = format!(
                        "{} of {} member(s) of '{}' failed (first: {})",
                        failures,
                        parent.members.len(),
                        parent_id,
                        first.unwrap_or(cause)
                    );
                    if let Some(callback) = &parent.callback {
                        self.skip(callback);
                        cause.push_str("; callback not dispatched");
                    }
                    self.complete(&parent_id, NodeState::Failed, None, Some(cause));
                }
            }
            (Shape::Chord, Position::Callback) => {
                if ok {
                    self.complete(&parent_id, NodeState::Succeeded, Some(output), None);
                } else {
                    self.complete(&parent_id, NodeState::Failed, None, Some(cause));
                }
            }
            (shape, position) => {
                error!(
                    "Node '{}' at {:?} cannot settle into a {:?} parent",
                    id, position, shape
                );
            }
        }
    }

    /// Whether a failure of `id` is absorbed by a best-effort ancestor.
    fn tolerated_above(&self, id: &str) -> bool {
        let mut parent = self.plan.index.get(id).and_then(|e| e.parent.clone());
        while let Some(current) = parent {
            match self.plan.index.get(&current) {
                Some(entry) if entry.best_effort => return true,
                Some(entry) => parent = entry.parent.clone(),
                None => return false,
            }
        }
        false
    }

    fn first_failed_member(&self, members: &[NodeId]) -> Option<String> {
        members.iter().find_map(|m| {
            self.nodes
                .get(m)
                .filter(|r| r.state == NodeState::Failed && !r.tolerated)
                .map(|r| r.cause.clone().unwrap_or_else(|| m.clone()))
        })
    }

    fn complete(&mut self, id: &str, state: NodeState, output: Option<Value>, cause: Option<String>) {
        let record = self.record_mut(id);
        record.state = state;
        record.output = output;
        record.cause = cause;
        self.effects.push(Effect::Persist(id.to_string()));
        self.ready.push_back(Step::Settled {
            node: id.to_string(),
        });
    }

    /// Mark a never-started subtree as skipped.
    fn skip(&mut self, id: &str) {
        for node in self.plan.index.subtree(id) {
            if let Some(record) = self.nodes.get_mut(&node) {
                if !record.state.is_terminal() {
                    record.state = NodeState::Skipped;
                    self.effects.push(Effect::Persist(node));
                }
            }
        }
    }

    fn finish(&mut self, ok: bool) {
        let tolerated = self.nodes.values().any(|r| r.tolerated);
        self.state = match (ok, tolerated) {
            (true, false) => WorkflowState::Succeeded,
            (true, true) => WorkflowState::PartiallyFailed,
            (false, _) => WorkflowState::Failed,
        };
        info!("Workflow '{}' finished: {}", self.id, self.state);
        self.ready.clear();
        self.effects.push(Effect::PersistHeader);
    }
}
