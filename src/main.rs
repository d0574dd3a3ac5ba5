use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use workflow_orchestrator::storage::{SqliteDeadLetterSink, SqliteStateStore};
use workflow_orchestrator::task::example_task::{ExampleTask, WriteResults};
use workflow_orchestrator::{
    Engine, EngineOptions, RetryPolicy, StateStore, Step, TaskPolicy, TaskRegistry, WorkflowSpec,
};

fn load_options() -> Result<EngineOptions, Box<dyn std::error::Error + Send + Sync>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(EngineOptions::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    println!("Starting the workflow orchestrator demo...");

    // Step 1: Set up the storage backends.
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:orchestrator.db".to_string());
    let store = Arc::new(SqliteStateStore::new(&database_url).await?);
    store.init().await?;
    let dead_letters = Arc::new(SqliteDeadLetterSink::new(store.pool.clone()));
    dead_letters.init().await?;

    // Step 2: Register the task kinds.
    let quick = Duration::from_millis(200);
    let mut registry = TaskRegistry::new();
    registry.register(
        "validate_user",
        ExampleTask::new("validate_user"),
        TaskPolicy::new(RetryPolicy::exponential(3, quick)),
    )?;
    registry.register(
        "send_verification_email",
        // the mail server is flaky on the first attempt
        ExampleTask::new("send_verification_email").failing(1),
        TaskPolicy::new(RetryPolicy::linear(3, quick)),
    )?;
    registry.register(
        "generate_auth_token",
        ExampleTask::new("generate_auth_token"),
        TaskPolicy::new(RetryPolicy::exponential(3, quick)),
    )?;
    registry.register(
        "log_signup_attempt",
        ExampleTask::new("log_signup_attempt").failing(u32::MAX),
        TaskPolicy::default(),
    )?;
    registry.register(
        "write_to_database",
        WriteResults {
            target: "users".to_string(),
        },
        TaskPolicy::new(RetryPolicy::default()).with_timeout(Duration::from_secs(5)),
    )?;
    registry.register(
        "process_file",
        ExampleTask::new("process_file"),
        TaskPolicy::new(RetryPolicy::exponential(2, quick)),
    )?;
    registry.register(
        "write_results",
        WriteResults {
            target: "file_results".to_string(),
        },
        TaskPolicy::default(),
    )?;

    // Step 3: Start the engine.
    let engine = Engine::builder()
        .store(store)
        .dead_letter_sink(dead_letters)
        .options(load_options()?)
        .start(registry)
        .await?;

    // Step 4: Submit the workflows.
    let signup = WorkflowSpec::new(
        "user_signup",
        Step::chain(vec![
            Step::task("validate_user").with_input(json!("User123")),
            Step::task("send_verification_email"),
            Step::task("generate_auth_token"),
            Step::task("log_signup_attempt").best_effort(),
            Step::task("write_to_database").commit(),
        ]),
    );
    let files = WorkflowSpec::new(
        "file_processing",
        Step::chord(
            ["file1.txt", "file2.txt", "file3.txt"]
                .iter()
                .map(|name| Step::task("process_file").with_input(json!(name)))
                .collect(),
            Step::task("write_results"),
        )
        .expecting(3),
    );

    let mut ids = Vec::new();
    for spec in [signup, files] {
        let name = spec.name.clone();
        let id = engine.submit(spec).await?;
        println!("Submitted '{}' as {}", name, id);
        ids.push(id);
    }

    // Step 5: Wait for the results.
    for id in &ids {
        let status = engine.wait(id).await?;
        println!("Workflow {} ({}): {}", status.name, id, status.state);
        for (node, node_status) in &status.nodes {
            println!(
                "  {}: {} after {} attempt(s){}",
                node,
                node_status.state,
                node_status.attempts,
                if node_status.tolerated { " (tolerated)" } else { "" }
            );
        }
        if let Some(result) = &status.result {
            println!("  result: {}", result);
        }
    }

    engine.shutdown().await;
    Ok(())
}
