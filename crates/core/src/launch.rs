//! How produced runs (scheduler, triggers, materializer, manual API)
//! reach the executor.
//!
//! Inline mode executes the run on a spawned task immediately; queue
//! mode hands the id to an external worker loop. Both paths go through
//! `RunLauncher` so every producer enqueues the same way.

use crate::error::Result;
use crate::types::WorkflowRunId;
use crate::workflow::executor::WorkflowExecutor;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait RunLauncher: Send + Sync {
    async fn enqueue(&self, run_id: WorkflowRunId) -> Result<()>;
}

/// Executes each enqueued run on a freshly spawned task.
pub struct InlineRunLauncher {
    executor: Arc<WorkflowExecutor>,
}

impl InlineRunLauncher {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait::async_trait]
impl RunLauncher for InlineRunLauncher {
    async fn enqueue(&self, run_id: WorkflowRunId) -> Result<()> {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.execute(run_id).await {
                tracing::error!(run = %run_id, error = %e, "inline run execution failed");
            }
        });
        Ok(())
    }
}

/// Hands run ids to an external worker loop.
pub struct QueueRunLauncher {
    sender: tokio::sync::mpsc::UnboundedSender<WorkflowRunId>,
}

impl QueueRunLauncher {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<WorkflowRunId>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl RunLauncher for QueueRunLauncher {
    async fn enqueue(&self, run_id: WorkflowRunId) -> Result<()> {
        self.sender
            .send(run_id)
            .map_err(|_| crate::error::Error::store("run queue receiver dropped"))
    }
}

/// Accepts runs without dispatching them; used when the caller drives
/// execution itself (synchronous API mode).
pub struct NoopRunLauncher;

#[async_trait::async_trait]
impl RunLauncher for NoopRunLauncher {
    async fn enqueue(&self, _run_id: WorkflowRunId) -> Result<()> {
        Ok(())
    }
}

/// Records enqueued ids without executing anything (tests).
#[derive(Default)]
pub struct RecordingRunLauncher {
    pub enqueued: std::sync::Mutex<Vec<WorkflowRunId>>,
}

impl RecordingRunLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<WorkflowRunId> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RunLauncher for RecordingRunLauncher {
    async fn enqueue(&self, run_id: WorkflowRunId) -> Result<()> {
        self.enqueued.lock().unwrap().push(run_id);
        Ok(())
    }
}
