//! # Workflow Orchestrator
//!
//! An asynchronous task workflow orchestration engine for Rust. Workflows are
//! trees of sequential chains, parallel groups and chords (a group whose
//! callback runs only when every member succeeded), executed at least once by
//! a pool of workers.
//!
//! ## Features
//!
//! - Declarative workflows, from JSON or built in code
//! - Retries with none/linear/exponential backoff and per-task overrides
//! - At most one running attempt per task, even under duplicate delivery
//! - Dead-lettering of tasks that ran out of attempts
//! - A commit gate that keeps side-effecting steps from firing on partial success
//! - Best-effort steps and `PartiallyFailed` workflows
//! - Durable node state with compare-and-swap, and crash recovery
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use workflow_orchestrator::{
//!     Engine, RetryPolicy, Step, Task, TaskError, TaskInput, TaskPolicy, TaskRegistry,
//!     WorkflowSpec,
//! };
//!
//! struct Greet;
//!
//! #[async_trait]
//! impl Task for Greet {
//!     async fn execute(&self, input: TaskInput) -> Result<Value, TaskError> {
//!         Ok(json!(format!("hello {}", input.payload)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut registry = TaskRegistry::new();
//!     registry.register("greet", Greet, TaskPolicy::new(RetryPolicy::default()))?;
//!
//!     let engine = Engine::start(registry).await?;
//!     let id = engine
//!         .submit(WorkflowSpec::new(
//!             "greetings",
//!             Step::chain(vec![
//!                 Step::task("greet").with_input(json!("Ann")),
//!                 Step::task("greet").with_input(json!("Bob")),
//!             ]),
//!         ))
//!         .await?;
//!
//!     let status = engine.wait(&id).await?;
//!     println!("{}: {:?}", status.state, status.result);
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod storage;
pub mod task;
pub mod transport;

pub use dead_letter::{DeadLetterEntry, DeadLetterRouter, DeadLetterSink};
pub use engine::{
    CommitGate, Composer, Engine, EngineBuilder, EngineOptions, NodeState, Step, WorkflowSpec,
    WorkflowState, WorkflowStatus,
};
pub use error::EngineError;
pub use storage::StateStore;
pub use task::{
    BackoffKind, RetryPolicy, Task, TaskError, TaskInput, TaskPolicy, TaskRegistry, TaskSpec,
};
pub use transport::{MemoryTransport, Transport};
