use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::scheduler::Command;
use crate::task::{TaskAttempt, TaskRunner};
use crate::transport::Transport;

/// One worker loop: dequeue, claim, execute, report, ack.
pub(crate) struct TaskExecutor {
    id: usize,
    runner: TaskRunner,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskExecutor {
    pub fn new(
        id: usize,
        runner: TaskRunner,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            runner,
            transport,
            commands,
        }
    }

    /// Start `count` workers that run until `shutdown` flips to `true` or the
    /// transport goes away.
    pub fn spawn_pool(
        count: usize,
        runner: TaskRunner,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedSender<Command>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|id| {
                let worker =
                    TaskExecutor::new(id, runner.clone(), transport.clone(), commands.clone());
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {} started", self.id);
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }
            let attempt = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => break,
                },
                next = self.transport.dequeue() => match next {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        warn!("Worker {} stopping: {}", self.id, e);
                        break;
                    }
                },
            };
            self.process(attempt).await;
        }
        debug!("Worker {} stopped", self.id);
    }

    /// Handle one delivery. The transport is acked once the scheduler has the
    /// outcome, and nacked if the scheduler cannot be reached.
    pub async fn process(&self, attempt: TaskAttempt) {
        let (reply, granted) = oneshot::channel();
        let claim = Command::Claim {
            workflow_id: attempt.workflow_id.clone(),
            node_id: attempt.node_id.clone(),
            attempt_id: attempt.id.clone(),
            reply,
        };
        if self.commands.send(claim).is_err() {
            self.give_back(&attempt).await;
            return;
        }
        match granted.await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Worker {} dropping stale delivery '{}'", self.id, attempt.id);
                self.acknowledge(&attempt).await;
                return;
            }
            Err(_) => {
                self.give_back(&attempt).await;
                return;
            }
        }

        info!(
            "Worker {} executing '{}' ({}, attempt {})",
            self.id, attempt.node_id, attempt.spec.kind, attempt.number
        );
        let decision = self.runner.execute(&attempt).await;

        let outcome = Command::Outcome {
            workflow_id: attempt.workflow_id.clone(),
            node_id: attempt.node_id.clone(),
            attempt_id: attempt.id.clone(),
            decision,
        };
        if self.commands.send(outcome).is_err() {
            self.give_back(&attempt).await;
            return;
        }
        self.acknowledge(&attempt).await;
    }

    async fn acknowledge(&self, attempt: &TaskAttempt) {
        if let Err(e) = self.transport.ack(&attempt.id).await {
            error!("Failed to ack '{}': {}", attempt.id, e);
        }
    }

    async fn give_back(&self, attempt: &TaskAttempt) {
        warn!(
            "Worker {} cannot reach the scheduler, returning '{}'",
            self.id, attempt.id
        );
        if let Err(e) = self.transport.nack(&attempt.id).await {
            error!("Failed to nack '{}': {}", attempt.id, e);
        }
    }
}
