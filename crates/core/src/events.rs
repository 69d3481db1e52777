use crate::types::{
    AssetFreshness, WorkflowDefinitionId, WorkflowRunId, WorkflowRunStepId, WorkflowRunStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ASSET_PRODUCED: &str = "asset.produced";
pub const RUN_PENDING: &str = "workflow.run.pending";
pub const RUN_RUNNING: &str = "workflow.run.running";
pub const RUN_SUCCEEDED: &str = "workflow.run.succeeded";
pub const RUN_FAILED: &str = "workflow.run.failed";
pub const RUN_CANCELED: &str = "workflow.run.canceled";

/// Wire envelope for everything crossing the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: None,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Payload of an `asset.produced` event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetProducedPayload {
    pub asset_id: String,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub workflow_run_id: WorkflowRunId,
    pub workflow_run_step_id: WorkflowRunStepId,
    pub step_id: String,
    pub produced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<AssetFreshness>,
}

/// Payload of a `workflow.run.*` lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLifecyclePayload {
    pub workflow_definition_id: WorkflowDefinitionId,
    pub workflow_run_id: WorkflowRunId,
    pub status: WorkflowRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub fn run_lifecycle_event_type(status: WorkflowRunStatus) -> &'static str {
    match status {
        WorkflowRunStatus::Pending => RUN_PENDING,
        WorkflowRunStatus::Running => RUN_RUNNING,
        WorkflowRunStatus::Succeeded => RUN_SUCCEEDED,
        WorkflowRunStatus::Failed => RUN_FAILED,
        WorkflowRunStatus::Canceled => RUN_CANCELED,
    }
}

/// Pub/sub collaborator the core publishes lifecycle and asset events to
pub trait EventBus: Send + Sync {
    fn publish(&self, event: EventEnvelope);

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope>;
}

/// In-process bus over a tokio broadcast channel. Slow subscribers may
/// observe lag; the orchestration paths that must not drop events read
/// the record store instead of replaying the bus.
pub struct BroadcastEventBus {
    sender: tokio::sync::broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: EventEnvelope) {
        tracing::debug!(event_type = %event.event_type, event_id = %event.id, "publishing event");
        // Send fails only when no subscriber is attached; that is fine.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}
