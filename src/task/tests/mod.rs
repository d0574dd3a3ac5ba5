#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::task::{
        BackoffKind, Decision, Outcome, RetryPolicy, Task, TaskAttempt, TaskError, TaskInput,
        TaskPolicy, TaskRegistry, TaskRunner, TaskSpec,
    };
    use crate::NodeState;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    // Test RetryPolicy
    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.backoff, BackoffKind::None);
        assert_eq!(policy.base_delay.as_secs(), 0);
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::default()
            .with_max_retries(3)
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(30));

        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay.as_secs(), 2);
        assert_eq!(policy.max_delay.as_secs(), 30);
    }

    #[test]
    fn test_linear_delay_is_constant() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(2));
        for attempt in 1..=5 {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(2));
        }
    }

    #[test]
    fn test_no_backoff_is_immediate() {
        let policy = RetryPolicy::new(2, BackoffKind::None, Duration::from_secs(9));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_delay_doubles_until_ceiling() {
        let base = Duration::from_millis(500);
        let policy = RetryPolicy::exponential(6, base).with_max_delay(Duration::from_secs(8));

        for attempt in 1..=5 {
            assert_eq!(policy.delay_for(attempt), base * 2u32.pow(attempt - 1));
        }
        // 500ms * 2^5 = 16s, capped
        assert_eq!(policy.delay_for(6), Duration::from_secs(8));
        // absurd attempt numbers must not overflow
        assert_eq!(policy.delay_for(200), Duration::from_secs(8));
    }

    #[test]
    fn test_allows_retry_after() {
        let policy = RetryPolicy::linear(2, Duration::from_secs(1));
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    // Test Task implementation
    #[derive(Clone)]
    struct TestTask {
        should_fail: bool,
    }

    #[async_trait]
    impl Task for TestTask {
        async fn execute(&self, input: TaskInput) -> Result<Value, TaskError> {
            if self.should_fail {
                Err("Task failed".into())
            } else {
                Ok(input.payload)
            }
        }
    }

    struct SlowTask;

    #[async_trait]
    impl Task for SlowTask {
        async fn execute(&self, _input: TaskInput) -> Result<Value, TaskError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    struct PanickingTask;

    #[async_trait]
    impl Task for PanickingTask {
        async fn execute(&self, _input: TaskInput) -> Result<Value, TaskError> {
            panic!("boom");
        }
    }

    fn spec(kind: &str, retry: RetryPolicy) -> TaskSpec {
        TaskSpec {
            kind: kind.to_string(),
            input: json!({"n": 1}),
            retry,
            idempotency_key: format!("wf/{}", kind),
            timeout: None,
        }
    }

    fn attempt(spec: TaskSpec, number: u32) -> TaskAttempt {
        TaskAttempt {
            id: TaskAttempt::attempt_id("wf", "node", number),
            workflow_id: "wf".to_string(),
            node_id: "node".to_string(),
            spec,
            number,
            state: NodeState::Pending,
            scheduled_at: chrono::Utc::now(),
            upstream: None,
        }
    }

    fn runner_with(register: impl FnOnce(&mut TaskRegistry)) -> TaskRunner {
        let mut registry = TaskRegistry::new();
        register(&mut registry);
        TaskRunner::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_task_execution_success() {
        let task = TestTask { should_fail: false };
        let input = TaskInput {
            payload: json!("hello"),
            upstream: None,
            attempt: 1,
            idempotency_key: "k".to_string(),
        };
        assert_eq!(task.execute(input).await, Ok(json!("hello")));
    }

    #[test]
    fn test_task_error_displays_its_message() {
        let err = TaskError::fatal("card declined");
        assert_eq!(err.to_string(), "card declined");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err.clone());
        assert_eq!(TaskError::from(boxed), TaskError::retryable("card declined"));
    }

    #[test]
    fn test_register_duplicate_kind() {
        let mut registry = TaskRegistry::new();
        registry
            .register("work", TestTask { should_fail: false }, TaskPolicy::default())
            .unwrap();
        let err = registry
            .register("work", TestTask { should_fail: true }, TaskPolicy::default())
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateKind("work".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_kind() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("missing").err().unwrap();
        assert_eq!(err, EngineError::UnknownKind("missing".to_string()));
    }

    #[test]
    fn test_decide_retries_then_exhausts() {
        let runner = runner_with(|_| {});
        let spec = spec("work", RetryPolicy::exponential(3, Duration::from_secs(1)));
        let failure = || Outcome::Failure {
            cause: "nope".to_string(),
            retryable: true,
        };

        for (attempt, expected) in [(1, 1), (2, 2), (3, 4)] {
            assert_eq!(
                runner.decide(&spec, attempt, failure()),
                Decision::Retry {
                    delay: Duration::from_secs(expected),
                    cause: "nope".to_string()
                }
            );
        }
        assert_eq!(
            runner.decide(&spec, 4, failure()),
            Decision::Exhausted {
                cause: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_decide_fatal_failure_skips_budget() {
        let runner = runner_with(|_| {});
        let spec = spec("work", RetryPolicy::linear(5, Duration::from_secs(1)));
        let decision = runner.decide(
            &spec,
            1,
            Outcome::Failure {
                cause: "bad input".to_string(),
                retryable: false,
            },
        );
        assert_eq!(
            decision,
            Decision::Exhausted {
                cause: "bad input".to_string()
            }
        );
    }

    #[test]
    fn test_decide_uses_registered_override() {
        let runner = runner_with(|registry| {
            registry
                .register_backoff_override("slow-start", |attempt, _| {
                    Some(Duration::from_secs(100 * attempt as u64))
                })
                .unwrap();
        });
        let spec = spec(
            "work",
            RetryPolicy::linear(3, Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(150))
                .with_delay_override("slow-start"),
        );
        let failure = || Outcome::Failure {
            cause: "x".to_string(),
            retryable: true,
        };
        assert_eq!(
            runner.decide(&spec, 1, failure()),
            Decision::Retry {
                delay: Duration::from_secs(100),
                cause: "x".to_string()
            }
        );
        // capped by max_delay
        assert_eq!(
            runner.decide(&spec, 2, failure()),
            Decision::Retry {
                delay: Duration::from_secs(150),
                cause: "x".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_execute_success_returns_payload() {
        let runner = runner_with(|registry| {
            registry
                .register("work", TestTask { should_fail: false }, TaskPolicy::default())
                .unwrap();
        });
        let decision = runner
            .execute(&attempt(spec("work", RetryPolicy::default()), 1))
            .await;
        assert_eq!(decision, Decision::Success(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_execute_unknown_kind_is_exhausted() {
        let runner = runner_with(|_| {});
        let decision = runner
            .execute(&attempt(
                spec("ghost", RetryPolicy::linear(3, Duration::from_secs(1))),
                1,
            ))
            .await;
        assert!(matches!(decision, Decision::Exhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout_is_retryable() {
        let runner = runner_with(|registry| {
            registry
                .register(
                    "slow",
                    SlowTask,
                    TaskPolicy::default().with_timeout(Duration::from_secs(1)),
                )
                .unwrap();
        });
        let decision = runner
            .execute(&attempt(
                spec("slow", RetryPolicy::linear(1, Duration::from_secs(2))),
                1,
            ))
            .await;
        assert!(matches!(decision, Decision::Retry { delay, .. } if delay == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_execute_panic_is_contained() {
        let runner = runner_with(|registry| {
            registry
                .register("panics", PanickingTask, TaskPolicy::default())
                .unwrap();
        });
        let decision = runner
            .execute(&attempt(spec("panics", RetryPolicy::default()), 1))
            .await;
        assert_eq!(
            decision,
            Decision::Exhausted {
                cause: "task panicked".to_string()
            }
        );
    }
}
