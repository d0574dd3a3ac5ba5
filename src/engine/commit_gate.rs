//! Atomic commit gate.
//!
//! Nodes with external, non-idempotent side effects are registered here with
//! the nodes that must have succeeded before they may fire. The scheduler
//! asks the gate before dispatching such a node.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::node_state::NodeState;
use super::plan::NodeId;
use crate::error::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitGate {
    guarded: HashMap<NodeId, Vec<NodeId>>,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add preconditions for `node`. Repeated calls accumulate.
    pub fn guard<I>(&mut self, node: impl Into<NodeId>, preconditions: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let entry = self.guarded.entry(node.into()).or_default();
        for precondition in preconditions {
            if !entry.contains(&precondition) {
                entry.push(precondition);
            }
        }
    }

    pub fn is_guarded(&self, node: &str) -> bool {
        self.guarded.contains_key(node)
    }

    pub fn preconditions(&self, node: &str) -> &[NodeId] {
        self.guarded.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn guarded_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.guarded.keys()
    }

    /// Admit `node` for execution.
    ///
    /// Succeeds only when every precondition is `Succeeded` according to
    /// `state_of`; otherwise reports the preconditions that are not.
    pub fn commit<F>(&self, node: &str, state_of: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<NodeState>,
    {
        let missing: Vec<NodeId> = self
            .preconditions(node)
            .iter()
            .filter(|id| state_of(id) != Some(NodeState::Succeeded))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            warn!(
                "Commit of node '{}' refused, preconditions not met: {:?}",
                node, missing
            );
            Err(EngineError::PreconditionNotMet {
                node: node.to_string(),
                missing,
            })
        }
    }
}
