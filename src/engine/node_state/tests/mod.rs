#[cfg(test)]
mod tests {
    use super::super::{NodeState, WorkflowState};

    const ALL: [NodeState; 8] = [
        NodeState::Blocked,
        NodeState::Pending,
        NodeState::Running,
        NodeState::Retrying,
        NodeState::Succeeded,
        NodeState::Failed,
        NodeState::Skipped,
        NodeState::Cancelled,
    ];

    #[test]
    fn test_node_state_as_str() {
        assert_eq!(NodeState::Pending.as_str(), "pending");
        assert_eq!(NodeState::Running.as_str(), "running");
        assert_eq!(NodeState::Retrying.as_str(), "retrying");
        assert_eq!(NodeState::Succeeded.as_str(), "succeeded");
        assert_eq!(NodeState::Failed.as_str(), "failed");
    }

    #[test]
    fn test_node_state_from_str() {
        for state in ALL {
            assert_eq!(NodeState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(NodeState::from_str("completed"), None);
    }

    #[test]
    fn test_node_state_display() {
        assert_eq!(format!("{}", NodeState::Blocked), "blocked");
        assert_eq!(format!("{}", NodeState::Skipped), "skipped");
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<NodeState> = ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                NodeState::Succeeded,
                NodeState::Failed,
                NodeState::Skipped,
                NodeState::Cancelled
            ]
        );
    }

    #[test]
    fn test_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeState::Retrying).unwrap(),
            "\"retrying\""
        );
        assert_eq!(
            serde_json::to_string(&WorkflowState::PartiallyFailed).unwrap(),
            "\"partially_failed\""
        );
        assert!(!WorkflowState::Running.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
    }
}
