//! Turns a declarative [`WorkflowSpec`] into an executable [`Plan`].

use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::commit_gate::CommitGate;
use super::definition::{Step, WorkflowSpec};
use super::plan::{NodeId, Plan, PlanKind, PlanNode};
use crate::error::EngineError;
use crate::task::{TaskRegistry, TaskSpec};

const ROOT_ID: &str = "root";

pub struct Composer<'r> {
    registry: &'r TaskRegistry,
    max_backoff: Option<Duration>,
}

impl<'r> Composer<'r> {
    pub fn new(registry: &'r TaskRegistry) -> Self {
        Self {
            registry,
            max_backoff: None,
        }
    }

    /// Cap every retry delay of composed plans at `ceiling`.
    pub fn with_max_backoff(mut self, ceiling: Duration) -> Self {
        self.max_backoff = Some(ceiling);
        self
    }

    /// Build the plan for one workflow instance.
    ///
    /// Node ids are the explicit step ids where given, otherwise derived from
    /// the position in the tree (`root`, `root.0`, `root.1.callback`, ...), so
    /// composing the same spec twice yields the same ids.
    pub fn compose(&self, spec: &WorkflowSpec, workflow_id: &str) -> Result<Plan, EngineError> {
        debug!(
            "Composing workflow '{}' for instance '{}'",
            spec.name, workflow_id
        );

        let mut build = Build {
            registry: self.registry,
            max_backoff: self.max_backoff,
            spec,
            workflow_id,
            seen: HashSet::new(),
            expanding: Vec::new(),
            flags: HashMap::new(),
        };
        let root = build.node(&spec.root, ROOT_ID.to_string(), false)?;
        let flags = build.flags;

        validate_requires(&root, &flags)?;

        let mut gate = CommitGate::new();
        guard_leaves(&root, &[], false, &flags, &mut gate);

        Ok(Plan::new(root, gate))
    }
}

/// Commit-related flags of a leaf, kept aside while the tree is built.
#[derive(Default)]
struct LeafFlags {
    commit: bool,
    requires: Vec<String>,
}

struct Build<'a> {
    registry: &'a TaskRegistry,
    max_backoff: Option<Duration>,
    spec: &'a WorkflowSpec,
    workflow_id: &'a str,
    seen: HashSet<NodeId>,
    /// Fragments currently being expanded, outermost first.
    expanding: Vec<String>,
    flags: HashMap<NodeId, LeafFlags>,
}

impl<'a> Build<'a> {
    fn claim_id(&mut self, explicit: &Option<String>, path: String) -> Result<NodeId, EngineError> {
        let id = explicit.clone().unwrap_or(path);
        if id.is_empty() {
            return Err(EngineError::InvalidComposition(
                "node ids must not be empty".to_string(),
            ));
        }
        if !self.seen.insert(id.clone()) {
            return Err(EngineError::InvalidComposition(format!(
                "node id '{}' is used more than once",
                id
            )));
        }
        Ok(id)
    }

    fn node(&mut self, step: &'a Step, path: String, inherited_best_effort: bool) -> Result<PlanNode, EngineError> {
        match step {
            Step::Task(task) => {
                let id = self.claim_id(&task.id, path)?;
                let registered = self.registry.resolve(&task.kind)?;
                let mut retry = task
                    .retry
                    .clone()
                    .unwrap_or_else(|| registered.policy.retry.clone());
                if let Some(ceiling) = self.max_backoff {
                    retry.max_delay = retry.max_delay.min(ceiling);
                }
                let spec = TaskSpec {
                    kind: task.kind.clone(),
                    input: task.input.clone(),
                    retry,
                    idempotency_key: task
                        .idempotency_key
                        .clone()
                        .unwrap_or_else(|| format!("{}/{}", self.workflow_id, id)),
                    timeout: task.timeout,
                };
                if task.commit || !task.requires.is_empty() {
                    self.flags.insert(
                        id.clone(),
                        LeafFlags {
                            commit: task.commit,
                            requires: task.requires.clone(),
                        },
                    );
                }
                Ok(PlanNode {
                    id,
                    best_effort: task.best_effort || inherited_best_effort,
                    kind: PlanKind::Leaf(spec),
                })
            }
            Step::Chain(chain) => {
                let id = self.claim_id(&chain.id, path)?;
                if chain.steps.is_empty() {
                    return Err(EngineError::InvalidComposition(format!(
                        "chain '{}' has no steps",
                        id
                    )));
                }
                let children = self.children(&id, &chain.steps)?;
                Ok(PlanNode {
                    id,
                    best_effort: chain.best_effort || inherited_best_effort,
                    kind: PlanKind::Chain(children),
                })
            }
            Step::Group(group) => {
                let id = self.claim_id(&group.id, path)?;
                if group.steps.is_empty() {
                    return Err(EngineError::InvalidComposition(format!(
                        "group '{}' is empty",
                        id
                    )));
                }
                let children = self.children(&id, &group.steps)?;
                Ok(PlanNode {
                    id,
                    best_effort: group.best_effort || inherited_best_effort,
                    kind: PlanKind::Group(children),
                })
            }
            Step::Chord(chord) => {
                let id = self.claim_id(&chord.id, path)?;
                if chord.group.is_empty() {
                    return Err(EngineError::InvalidComposition(format!(
                        "chord '{}' has an empty group",
                        id
                    )));
                }
                if let Some(expects) = chord.expects {
                    if expects != chord.group.len() {
                        return Err(EngineError::InvalidComposition(format!(
                            "chord '{}' callback expects {} input(s) but the group has {}",
                            id,
                            expects,
                            chord.group.len()
                        )));
                    }
                }
                let group = self.children(&id, &chord.group)?;
                let callback = self.node(&chord.callback, format!("{}.callback", id), false)?;
                Ok(PlanNode {
                    id,
                    best_effort: chord.best_effort || inherited_best_effort,
                    kind: PlanKind::Chord {
                        group,
                        callback: Box::new(callback),
                    },
                })
            }
            Step::Use(usage) => {
                if self.expanding.contains(&usage.fragment) {
                    let mut cycle = self.expanding.clone();
                    cycle.push(usage.fragment.clone());
                    return Err(EngineError::InvalidComposition(format!(
                        "cyclic fragment reference: {}",
                        cycle.join(" -> ")
                    )));
                }
                let spec = self.spec;
                let fragment = spec.fragments.get(&usage.fragment).ok_or_else(|| {
                    EngineError::InvalidComposition(format!(
                        "unknown fragment '{}'",
                        usage.fragment
                    ))
                })?;
                let path = usage.id.clone().unwrap_or(path);

                self.expanding.push(usage.fragment.clone());
                let result = self.node(fragment, path, usage.best_effort || inherited_best_effort);
                self.expanding.pop();
                result
            }
        }
    }

    fn children(&mut self, parent: &str, steps: &'a [Step]) -> Result<Vec<PlanNode>, EngineError> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.node(step, format!("{}.{}", parent, i), false))
            .collect()
    }
}

/// Every `requires` id must name a node that can finish before the leaf
/// starts: an existing node other than the leaf and its ancestors.
fn validate_requires(root: &PlanNode, flags: &HashMap<NodeId, LeafFlags>) -> Result<(), EngineError> {
    let mut ancestors: HashMap<&str, Vec<&str>> = HashMap::new();
    collect_ancestors(root, &mut Vec::new(), &mut ancestors);

    for (leaf, flag) in flags {
        for required in &flag.requires {
            if root.find(required).is_none() {
                return Err(EngineError::InvalidComposition(format!(
                    "node '{}' requires unknown node '{}'",
                    leaf, required
                )));
            }
            let above = ancestors.get(leaf.as_str()).cloned().unwrap_or_default();
            if required == leaf || above.contains(&required.as_str()) {
                return Err(EngineError::InvalidComposition(format!(
                    "node '{}' requires '{}', which cannot finish before it (cycle)",
                    leaf, required
                )));
            }
        }
    }
    Ok(())
}

fn collect_ancestors<'p>(
    node: &'p PlanNode,
    path: &mut Vec<&'p str>,
    out: &mut HashMap<&'p str, Vec<&'p str>>,
) {
    out.insert(node.id.as_str(), path.clone());
    path.push(node.id.as_str());
    for child in node.children() {
        collect_ancestors(child, path, out);
    }
    path.pop();
}

/// Register gated leaves with the commit gate.
///
/// `before` holds the structural predecessors of `node`: earlier
/// non-best-effort steps of enclosing chains and, inside a chord callback,
/// the chord's non-best-effort members.
fn guard_leaves(
    node: &PlanNode,
    before: &[NodeId],
    in_callback: bool,
    flags: &HashMap<NodeId, LeafFlags>,
    gate: &mut CommitGate,
) {
    match &node.kind {
        PlanKind::Leaf(_) => {
            let flag = flags.get(&node.id);
            let commit = flag.map_or(false, |f| f.commit);
            if commit || in_callback {
                gate.guard(node.id.clone(), before.iter().cloned());
            }
            if let Some(flag) = flag {
                gate.guard(node.id.clone(), flag.requires.iter().cloned());
            }
        }
        PlanKind::Chain(children) => {
            let mut preceding = before.to_vec();
            for child in children {
                guard_leaves(child, &preceding, in_callback, flags, gate);
                if !child.best_effort {
                    preceding.push(child.id.clone());
                }
            }
        }
        PlanKind::Group(children) => {
            for child in children {
                guard_leaves(child, before, in_callback, flags, gate);
            }
        }
        PlanKind::Chord { group, callback } => {
            for child in group {
                guard_leaves(child, before, in_callback, flags, gate);
            }
            let mut preceding = before.to_vec();
            preceding.extend(group.iter().filter(|c| !c.best_effort).map(|c| c.id.clone()));
            guard_leaves(callback, &preceding, true, flags, gate);
        }
    }
}
