use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a plan node. Leaves move through the attempt states; composite
/// nodes use the same set for their aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on an earlier node.
    Blocked,
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    /// Never dispatched because an earlier step failed.
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Blocked => "blocked",
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Retrying => "retrying",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(NodeState::Blocked),
            "pending" => Some(NodeState::Pending),
            "running" => Some(NodeState::Running),
            "retrying" => Some(NodeState::Retrying),
            "succeeded" => Some(NodeState::Succeeded),
            "failed" => Some(NodeState::Failed),
            "skipped" => Some(NodeState::Skipped),
            "cancelled" => Some(NodeState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Succeeded,
    /// The root succeeded but at least one best-effort node failed.
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Running => "running",
            WorkflowState::Succeeded => "succeeded",
            WorkflowState::PartiallyFailed => "partially_failed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Running)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests;
