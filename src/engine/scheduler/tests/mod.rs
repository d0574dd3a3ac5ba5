#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::dead_letter::{DeadLetterRouter, DeadLetterSink};
    use crate::engine::definition::Step;
    use crate::engine::node_state::{NodeState, WorkflowState};
    use crate::storage::{MemoryDeadLetterSink, MemoryStateStore};
    use crate::task::{RetryPolicy, Task, TaskError, TaskInput, TaskPolicy};
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    struct EmptyTask;

    #[async_trait]
    impl Task for EmptyTask {
        async fn execute(&self, _input: TaskInput) -> Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    /// Every compare-and-swap loses against an invisible writer.
    struct ContendedStore {
        inner: MemoryStateStore,
    }

    #[async_trait]
    impl StateStore for ContendedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: String) -> Result<(), EngineError> {
            self.inner.put(key, value).await
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _new: String,
        ) -> Result<bool, EngineError> {
            Ok(false)
        }
    }

    /// Refuses its first `failures` writes.
    struct FlakySink {
        failures: AtomicUsize,
        inner: MemoryDeadLetterSink,
    }

    #[async_trait]
    impl DeadLetterSink for FlakySink {
        async fn write(&self, entry: DeadLetterEntry) -> Result<(), EngineError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Storage("sink offline".to_string()));
            }
            self.inner.write(entry).await
        }

        async fn query(
            &self,
            kind: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<DeadLetterEntry>, EngineError> {
            self.inner.query(kind, from, to).await
        }
    }

    struct Harness {
        scheduler: Scheduler,
        store: MemoryStateStore,
        transport: Arc<MemoryTransport>,
        sink: MemoryDeadLetterSink,
    }

    fn build(
        store: Arc<dyn StateStore>,
        memory: MemoryStateStore,
        sink: MemoryDeadLetterSink,
        routed_to: Arc<dyn DeadLetterSink>,
        options: EngineOptions,
    ) -> Harness {
        let mut registry = TaskRegistry::new();
        for kind in ["a", "b"] {
            registry
                .register(kind, EmptyTask, TaskPolicy::new(RetryPolicy::default()))
                .unwrap();
        }
        let transport = Arc::new(MemoryTransport::new());
        let scheduler = Scheduler::new(
            Arc::new(registry),
            store,
            transport.clone(),
            Arc::new(DeadLetterRouter::new(routed_to)),
            options,
        );
        Harness {
            scheduler,
            store: memory,
            transport,
            sink,
        }
    }

    fn options() -> EngineOptions {
        EngineOptions::default().with_retention(Duration::from_secs(60))
    }

    fn harness_with(store: Arc<dyn StateStore>, memory: MemoryStateStore) -> Harness {
        let sink = MemoryDeadLetterSink::new();
        build(store, memory, sink.clone(), Arc::new(sink), options())
    }

    /// Dead letters go through a sink that refuses the first `failures` writes.
    fn harness_with_flaky_sink(failures: usize) -> Harness {
        let store = MemoryStateStore::new();
        let sink = MemoryDeadLetterSink::new();
        let flaky = FlakySink {
            failures: AtomicUsize::new(failures),
            inner: sink.clone(),
        };
        build(Arc::new(store.clone()), store, sink, Arc::new(flaky), options())
    }

    fn harness() -> Harness {
        let store = MemoryStateStore::new();
        harness_with(Arc::new(store.clone()), store)
    }

    impl Harness {
        /// Deliver the next attempt and report `decision` for it, the way a
        /// worker would.
        async fn run_next(&mut self, decision: Decision) -> String {
            let attempt = self.transport.dequeue().await.unwrap();
            let (reply, granted) = oneshot::channel();
            self.scheduler
                .handle(Command::Claim {
                    workflow_id: attempt.workflow_id.clone(),
                    node_id: attempt.node_id.clone(),
                    attempt_id: attempt.id.clone(),
                    reply,
                })
                .await;
            assert!(granted.await.unwrap());
            self.scheduler
                .handle(Command::Outcome {
                    workflow_id: attempt.workflow_id.clone(),
                    node_id: attempt.node_id.clone(),
                    attempt_id: attempt.id.clone(),
                    decision,
                })
                .await;
            self.transport.ack(&attempt.id).await.unwrap();
            attempt.id
        }
    }

    #[tokio::test]
    async fn test_persist_writes_and_tracks_version() {
        let store = MemoryStateStore::new();
        let options = EngineOptions::default();
        let mut versions = HashMap::new();

        assert_ok!(persist(&store, &options, &mut versions, "k".into(), "v1".into()).await);
        assert_ok!(persist(&store, &options, &mut versions, "k".into(), "v2".into()).await);
        assert_eq!(store.value("k").as_deref(), Some("v2"));
        assert_eq!(versions.get("k").map(String::as_str), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_never_overwrites_a_foreign_write() {
        let store = MemoryStateStore::new();
        let options = EngineOptions::default();
        let mut versions = HashMap::new();
        assert_ok!(persist(&store, &options, &mut versions, "k".into(), "mine".into()).await);

        // another writer moved the key on
        assert_ok!(store.put("k", "theirs".to_string()).await);

        let start = Instant::now();
        let result = persist(&store, &options, &mut versions, "k".into(), "mine again".into()).await;
        assert_eq!(result, Err(EngineError::PersistenceConflict("k".to_string())));
        assert_eq!(store.value("k").as_deref(), Some("theirs"));
        // 50ms + 100ms + 200ms of backoff
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(350) && waited < Duration::from_millis(360));
    }

    #[tokio::test]
    async fn test_persist_accepts_an_identical_foreign_write() {
        let store = MemoryStateStore::new();
        let options = EngineOptions::default();
        let mut versions = HashMap::new();
        assert_ok!(store.put("k", "same".to_string()).await);

        assert_ok!(persist(&store, &options, &mut versions, "k".into(), "same".into()).await);
        assert_eq!(versions.get("k").map(String::as_str), Some("same"));
    }

    #[tokio::test]
    async fn test_submit_persists_and_dispatches_root() {
        let mut h = harness();
        let spec = WorkflowSpec::new("single", Step::task("a"));
        let id = assert_ok!(h.scheduler.submit(spec).await);

        assert!(h.store.value(&workflow_key(&id)).is_some());
        let record: NodeRecord =
            serde_json::from_str(&h.store.value(&node_key(&id, "root")).unwrap()).unwrap();
        assert_eq!(record.state, NodeState::Pending);
        assert_eq!(h.transport.pending(), 1);
    }

    #[tokio::test]
    async fn test_invalid_submission_is_rejected() {
        let mut h = harness();
        let spec = WorkflowSpec::new("bad", Step::task("missing"));
        assert_eq!(
            h.scheduler.submit(spec).await,
            Err(EngineError::UnknownKind("missing".to_string()))
        );
        assert!(h.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_claim_is_denied() {
        let mut h = harness();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();
        let attempt = h.transport.dequeue().await.unwrap();

        let mut grants = Vec::new();
        for _ in 0..2 {
            let (reply, granted) = oneshot::channel();
            h.scheduler
                .handle(Command::Claim {
                    workflow_id: id.clone(),
                    node_id: attempt.node_id.clone(),
                    attempt_id: attempt.id.clone(),
                    reply,
                })
                .await;
            grants.push(granted.await.unwrap());
        }
        assert_eq!(grants, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_dispatched_when_due() {
        let mut h = harness();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();

        h.run_next(Decision::Retry {
            delay: Duration::from_secs(2),
            cause: "flaky".to_string(),
        })
        .await;
        assert_eq!(h.scheduler.retries.len(), 1);
        assert_eq!(h.transport.pending(), 0);

        h.scheduler.fire_due_retries().await;
        assert_eq!(h.transport.pending(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        h.scheduler.fire_due_retries().await;
        assert_eq!(h.transport.pending(), 1);

        let second = h.run_next(Decision::Success(json!("ok"))).await;
        assert_eq!(second, format!("{}/root/2", id));
        let status = h.scheduler.status(&id).unwrap();
        assert_eq!(status.state, WorkflowState::Succeeded);
        assert_eq!(status.nodes["root"].attempts, 2);
    }

    #[tokio::test]
    async fn test_exhausted_task_is_dead_lettered() {
        let mut h = harness();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();
        h.run_next(Decision::Exhausted {
            cause: "boom".to_string(),
        })
        .await;

        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workflow_id, id);
        assert_eq!(entries[0].idempotency_key, format!("{}/root", id));
        assert_eq!(h.scheduler.status(&id).unwrap().state, WorkflowState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_dead_letter_is_written_on_a_later_sweep() {
        let mut h = harness_with_flaky_sink(1);
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();
        h.run_next(Decision::Exhausted {
            cause: "boom".to_string(),
        })
        .await;
        assert!(h.sink.entries().is_empty());
        assert_eq!(h.scheduler.status(&id).unwrap().state, WorkflowState::Failed);

        // held past retention: the letter is still owed
        tokio::time::advance(Duration::from_secs(61)).await;
        h.scheduler.sweep();
        assert_ok!(h.scheduler.status(&id));

        h.scheduler.redeliver_dead_letters().await;
        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].idempotency_key, format!("{}/root", id));
        assert_eq!(entries[0].cause, "boom");

        h.scheduler.sweep();
        assert_eq!(
            h.scheduler.status(&id),
            Err(EngineError::UnknownWorkflow(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_persists_the_failed_workflow() {
        let mut h = harness();
        h.transport.close();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();

        let status = h.scheduler.status(&id).unwrap();
        assert_eq!(status.state, WorkflowState::Failed);
        assert!(status.failure.unwrap().cause.contains("Transport unavailable"));

        // what a recovering scheduler would read back
        let header: WorkflowHeader =
            serde_json::from_str(&h.store.value(&workflow_key(&id)).unwrap()).unwrap();
        assert_eq!(header.state, WorkflowState::Failed);
        let record: NodeRecord =
            serde_json::from_str(&h.store.value(&node_key(&id, "root")).unwrap()).unwrap();
        assert_eq!(record.state, NodeState::Cancelled);
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_keeps_the_loop_running() {
        let store = MemoryStateStore::new();
        let sink = MemoryDeadLetterSink::new();
        let h = build(
            Arc::new(store.clone()),
            store,
            sink.clone(),
            Arc::new(sink),
            options().with_sweep_interval(Duration::ZERO),
        );
        let (commands, receiver) = mpsc::unbounded_channel();
        let running = tokio::spawn(h.scheduler.run(receiver));

        let (reply, submitted) = oneshot::channel();
        commands
            .send(Command::Submit {
                spec: WorkflowSpec::new("single", Step::task("a")),
                reply,
            })
            .unwrap_or_else(|_| panic!("scheduler gone"));
        let id = submitted.await.unwrap().unwrap();

        let (reply, status) = oneshot::channel();
        commands
            .send(Command::Status { id, reply })
            .unwrap_or_else(|_| panic!("scheduler gone"));
        assert_eq!(status.await.unwrap().unwrap().state, WorkflowState::Running);

        commands
            .send(Command::Shutdown)
            .unwrap_or_else(|_| panic!("scheduler gone"));
        assert_ok!(running.await);
    }

    #[tokio::test]
    async fn test_waiters_are_told_on_completion() {
        let mut h = harness();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();

        let (reply, waiting) = oneshot::channel();
        h.scheduler
            .handle(Command::Wait {
                id: id.clone(),
                reply,
            })
            .await;
        h.run_next(Decision::Success(json!(1))).await;

        let status = waiting.await.unwrap().unwrap();
        assert_eq!(status.state, WorkflowState::Succeeded);
        assert_eq!(status.result, Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_workflows_are_archived_after_retention() {
        let mut h = harness();
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();
        h.run_next(Decision::Success(Value::Null)).await;

        h.scheduler.sweep();
        assert_ok!(h.scheduler.status(&id));

        tokio::time::advance(Duration::from_secs(61)).await;
        h.scheduler.sweep();
        assert_eq!(
            h.scheduler.status(&id),
            Err(EngineError::UnknownWorkflow(id.clone()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_conflict_fails_the_workflow() {
        let memory = MemoryStateStore::new();
        let mut h = harness_with(
            Arc::new(ContendedStore {
                inner: memory.clone(),
            }),
            memory,
        );
        let id = h
            .scheduler
            .submit(WorkflowSpec::new("single", Step::task("a")))
            .await
            .unwrap();

        let status = h.scheduler.status(&id).unwrap();
        assert_eq!(status.state, WorkflowState::Failed);
        assert!(status.failure.unwrap().cause.contains("Persistence conflict"));
        // nothing was dispatched for a workflow whose state is not durable
        assert_eq!(h.transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_recover_resumes_from_store() {
        let mut h = harness();
        let spec = WorkflowSpec::new("pair", Step::chain(vec![Step::task("a"), Step::task("b")]));
        let id = h.scheduler.submit(spec).await.unwrap();
        h.run_next(Decision::Success(json!("a done"))).await;
        assert_eq!(h.transport.pending(), 1);

        // a new scheduler over the same store, as after a crash
        let store = h.store.clone();
        let mut fresh = harness_with(Arc::new(store.clone()), store);
        let status = assert_ok!(fresh.scheduler.recover(&id).await);
        assert_eq!(status.nodes["root.0"].state, NodeState::Succeeded);
        assert_eq!(status.nodes["root.1"].state, NodeState::Pending);

        let attempt = fresh.transport.dequeue().await.unwrap();
        assert_eq!(attempt.id, format!("{}/root.1/1", id));
        assert_eq!(attempt.upstream, Some(json!("a done")));

        assert_err!(fresh.scheduler.recover("never-submitted").await);
    }
}
