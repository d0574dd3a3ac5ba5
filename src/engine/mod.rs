mod commit_gate;
mod composer;
mod definition;
mod due_queue;
mod executor;
mod instance;
mod node_state;
mod options;
mod plan;
mod scheduler;

use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use commit_gate::CommitGate;
pub use composer::Composer;
pub use definition::{ChordStep, CompositeStep, FragmentStep, Step, TaskStep, WorkflowSpec};
pub(crate) use due_queue::DueQueue;
pub use instance::{FailureReport, NodeRecord, NodeStatus, WorkflowHeader, WorkflowStatus};
pub use node_state::{NodeState, WorkflowState};
pub use options::EngineOptions;
pub use plan::{NodeId, Plan, PlanKind, PlanNode};

use crate::dead_letter::{DeadLetterEntry, DeadLetterRouter, DeadLetterSink};
use crate::error::EngineError;
use crate::storage::{MemoryDeadLetterSink, MemoryStateStore, StateStore};
use crate::task::{TaskRegistry, TaskRunner};
use crate::transport::{MemoryTransport, Transport};
use executor::TaskExecutor;
use scheduler::{Command, Scheduler};

/// Collects the collaborators an [`Engine`] runs against. Anything not set
/// falls back to the in-memory implementation.
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn Transport>>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    options: EngineOptions,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Freeze `registry`, start the scheduler loop and the worker pool.
    pub async fn start(self, registry: TaskRegistry) -> Result<Engine, EngineError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        store.init().await?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(MemoryTransport::new()));
        let sink = self
            .dead_letter_sink
            .unwrap_or_else(|| Arc::new(MemoryDeadLetterSink::new()));

        let registry = Arc::new(registry);
        let dead_letters = Arc::new(DeadLetterRouter::new(sink));
        let (commands, inbox) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);

        info!(
            "Starting engine with {} task kind(s) and {} worker(s)",
            registry.len(),
            self.options.workers
        );

        let scheduler = Scheduler::new(
            registry.clone(),
            store,
            transport.clone(),
            dead_letters.clone(),
            self.options.clone(),
        );
        let scheduler = tokio::spawn(scheduler.run(inbox));
        let workers = TaskExecutor::spawn_pool(
            self.options.workers.max(1),
            TaskRunner::new(registry),
            transport,
            commands.clone(),
            shutdown,
        );

        Ok(Engine {
            commands,
            dead_letters,
            stop,
            scheduler,
            workers,
        })
    }
}

/// A running orchestration engine.
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    dead_letters: Arc<DeadLetterRouter>,
    stop: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Start an engine on in-memory collaborators.
    pub async fn start(registry: TaskRegistry) -> Result<Engine, EngineError> {
        Self::builder().start(registry).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::EngineStopped)?;
        response.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// Compose and start a workflow, returning its id.
    pub async fn submit(&self, spec: WorkflowSpec) -> Result<String, EngineError> {
        self.request(|reply| Command::Submit { spec, reply }).await
    }

    pub async fn status(&self, id: &str) -> Result<WorkflowStatus, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Status { id, reply }).await
    }

    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Resolve once the workflow is terminal.
    pub async fn wait(&self, id: &str) -> Result<WorkflowStatus, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Wait { id, reply }).await
    }

    /// Reload a workflow from the state store and continue it.
    pub async fn recover(&self, id: &str) -> Result<WorkflowStatus, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::Recover { id, reply }).await
    }

    pub async fn dead_letters(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeadLetterEntry>, EngineError> {
        self.dead_letters.query(kind, from, to).await
    }

    /// Stop the workers and the scheduler. Running attempts finish first;
    /// workflows still running stay recoverable from the state store.
    pub async fn shutdown(self) {
        info!("Shutting down engine");
        let _ = self.stop.send(true);
        futures::future::join_all(self.workers).await;
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.scheduler.await;
    }
}
