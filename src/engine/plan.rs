//! Execution plans: the tree a workflow runs, and a flat index over it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::commit_gate::CommitGate;
use crate::task::TaskSpec;

pub type NodeId = String;

/// One node of an execution plan.
///
/// Every variant produces either a single attempt outcome (leaf, chain,
/// chord) or an ordered collection of outcomes (group), so the variants nest
/// freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: NodeId,
    /// A failure of this node does not fail its parent.
    pub best_effort: bool,
    pub kind: PlanKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Leaf(TaskSpec),
    /// Child `i + 1` starts only after child `i` succeeded.
    Chain(Vec<PlanNode>),
    /// All children run concurrently.
    Group(Vec<PlanNode>),
    /// A group whose callback runs iff every member succeeded.
    Chord {
        group: Vec<PlanNode>,
        callback: Box<PlanNode>,
    },
}

impl PlanNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, PlanKind::Leaf(_))
    }

    /// Direct children in declared order; a chord's callback comes last.
    pub fn children(&self) -> Vec<&PlanNode> {
        match &self.kind {
            PlanKind::Leaf(_) => Vec::new(),
            PlanKind::Chain(children) | PlanKind::Group(children) => children.iter().collect(),
            PlanKind::Chord { group, callback } => {
                group.iter().chain(std::iter::once(callback.as_ref())).collect()
            }
        }
    }

    /// Pre-order traversal.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a PlanNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    pub fn leaves(&self) -> Vec<&PlanNode> {
        let mut leaves = Vec::new();
        self.walk(&mut |node| {
            if node.is_leaf() {
                leaves.push(node);
            }
        });
        leaves
    }

    pub fn find(&self, id: &str) -> Option<&PlanNode> {
        let mut found = None;
        self.walk(&mut |node| {
            if found.is_none() && node.id == id {
                found = Some(node);
            }
        });
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Leaf,
    Chain,
    Group,
    Chord,
}

/// Where a node sits inside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    Root,
    Member(usize),
    Callback,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub parent: Option<NodeId>,
    pub position: Position,
    pub shape: Shape,
    /// Chain steps or group members, in declared order.
    pub members: Vec<NodeId>,
    pub callback: Option<NodeId>,
    pub best_effort: bool,
    pub spec: Option<TaskSpec>,
}

/// Flat lookup over a plan tree, so the scheduler can walk up to parents.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlanIndex {
    entries: HashMap<NodeId, IndexEntry>,
    order: Vec<NodeId>,
}

impl PlanIndex {
    pub fn build(root: &PlanNode) -> Self {
        let mut index = PlanIndex::default();
        index.insert(root, None, Position::Root);
        index
    }

    fn insert(&mut self, node: &PlanNode, parent: Option<&str>, position: Position) {
        let (shape, members, callback, spec) = match &node.kind {
            PlanKind::Leaf(spec) => (Shape::Leaf, Vec::new(), None, Some(spec.clone())),
            PlanKind::Chain(children) => (Shape::Chain, ids(children), None, None),
            PlanKind::Group(children) => (Shape::Group, ids(children), None, None),
            PlanKind::Chord { group, callback } => {
                (Shape::Chord, ids(group), Some(callback.id.clone()), None)
            }
        };
        self.order.push(node.id.clone());
        self.entries.insert(
            node.id.clone(),
            IndexEntry {
                parent: parent.map(str::to_string),
                position,
                shape,
                members,
                callback,
                best_effort: node.best_effort,
                spec,
            },
        );

        match &node.kind {
            PlanKind::Leaf(_) => {}
            PlanKind::Chain(children) | PlanKind::Group(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.insert(child, Some(&node.id), Position::Member(i));
                }
            }
            PlanKind::Chord { group, callback } => {
                for (i, child) in group.iter().enumerate() {
                    self.insert(child, Some(&node.id), Position::Member(i));
                }
                self.insert(callback, Some(&node.id), Position::Callback);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// Node ids in pre-order.
    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    /// `id` and every node below it, in pre-order.
    pub fn subtree(&self, id: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.entries.get(&current) {
                if let Some(callback) = &entry.callback {
                    stack.push(callback.clone());
                }
                stack.extend(entry.members.iter().rev().cloned());
            }
            out.push(current);
        }
        out
    }
}

fn ids(nodes: &[PlanNode]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.id.clone()).collect()
}

/// A composed workflow ready to run: the tree, its index and the commit gate
/// guarding its side-effecting leaves.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root: PlanNode,
    pub gate: CommitGate,
    pub(crate) index: PlanIndex,
}

impl Plan {
    pub fn new(root: PlanNode, gate: CommitGate) -> Self {
        let index = PlanIndex::build(&root);
        Self { root, gate, index }
    }
}
