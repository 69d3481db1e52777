use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::bundle::manifest::BundleManifest;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a job definition
    JobDefinitionId
);
uuid_id!(
    /// Unique identifier for a job run
    JobRunId
);
uuid_id!(
    /// Unique identifier for a workflow definition
    WorkflowDefinitionId
);
uuid_id!(
    /// Unique identifier for a workflow run
    WorkflowRunId
);
uuid_id!(
    /// Unique identifier for a persisted workflow run step
    WorkflowRunStepId
);
uuid_id!(
    /// Unique identifier for a schedule
    ScheduleId
);
uuid_id!(
    /// Unique identifier for a workflow event trigger
    TriggerId
);
uuid_id!(
    /// Unique identifier for a trigger delivery record
    DeliveryId
);
uuid_id!(
    /// Unique identifier for an asset materialization record
    MaterializationId
);

/// Runtime a job definition executes under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRuntimeKind {
    Node,
    Python,
    Docker,
}

/// Status of a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl JobRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Expired
        )
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Status of a single step within a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Where a bundle artifact's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleArtifactStorage {
    Local,
    S3,
}

/// Publication status of a bundle version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleVersionStatus {
    Published,
    Deprecated,
}

/// Retry strategy for steps and service calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

/// Retry policy shared by job runs, workflow steps and service calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "RetryPolicy::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

impl RetryPolicy {
    fn default_strategy() -> RetryStrategy {
        RetryStrategy::Fixed
    }

    fn default_initial_delay_ms() -> u64 {
        1_000
    }

    /// Delay to wait before the given attempt (attempt 2 is the first retry).
    pub fn delay_before_attempt(&self, attempt: u32) -> std::time::Duration {
        let retries = attempt.saturating_sub(2);
        let base = match self.strategy {
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => self
                .initial_delay_ms
                .saturating_mul(2u64.saturating_pow(retries)),
        };
        let capped = match self.max_delay_ms {
            Some(max) => base.min(max),
            None => base,
        };
        std::time::Duration::from_millis(capped)
    }
}

/// Registered job definition; identity is the slug, upserts bump `version`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: JobDefinitionId,
    pub slug: String,
    pub name: String,
    pub version: u32,
    pub runtime: JobRuntimeKind,
    pub entry_point: String,
    #[serde(default)]
    pub parameters_schema: Value,
    #[serde(default)]
    pub default_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Published, content-addressed bundle version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBundleVersion {
    pub bundle_slug: String,
    pub version: u32,
    pub manifest: BundleManifest,
    /// sha256 over the artifact bytes, hex-encoded
    pub checksum: String,
    pub artifact_storage: BundleArtifactStorage,
    pub artifact_path: String,
    pub immutable: bool,
    pub status: BundleVersionStatus,
    pub published_at: DateTime<Utc>,
}

impl JobBundleVersion {
    pub fn key(&self) -> String {
        format!("{}@{}", self.bundle_slug, self.version)
    }
}

/// A single execution of a job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: JobRunId,
    pub job_definition_id: JobDefinitionId,
    pub status: JobRunStatus,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default)]
    pub context: Value,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Freshness contract on a declared asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetFreshness {
    pub ttl_ms: u64,
}

/// Window granularity for time-window partitioned assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowGranularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

/// How an asset is sliced into partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AssetPartitioning {
    Static {
        keys: Vec<String>,
    },
    TimeWindow {
        granularity: WindowGranularity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Dynamic,
}

/// Auto-materialization policy on a produced asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMaterialize {
    #[serde(default)]
    pub on_upstream_update: bool,
    #[serde(default)]
    pub priority: i64,
}

/// Declaration of an asset a step produces or consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeclaration {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<AssetFreshness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning: Option<AssetPartitioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_materialize: Option<AutoMaterialize>,
}

/// Source of a secret reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    Env,
    Store,
}

/// Reference to a secret resolved at execution time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub source: SecretSource,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Header value on a service step: literal text or a secret reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValueSpec {
    Literal(String),
    Secret {
        secret: SecretRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

/// HTTP method on a service step request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "HEAD")]
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

/// Request template on a service step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub path: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValueSpec>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// How a job step binds to a bundle at dispatch time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStrategy {
    Pinned,
    Latest,
}

/// Bundle binding declared on a job step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBundle {
    pub slug: String,
    pub strategy: BundleStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

/// Step that dispatches a job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    pub id: String,
    pub job_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_result_as: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<AssetDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<AssetDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<StepBundle>,
}

/// Step that calls an external service over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStep {
    pub id: String,
    pub service_slug: String,
    pub request: ServiceRequest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_degraded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_response: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_response_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

/// Template a fan-out step expands per collection element.
/// Templates never declare their own dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FanoutTemplate {
    Job(JobStep),
    Service(ServiceStep),
}

impl FanoutTemplate {
    pub fn id(&self) -> &str {
        match self {
            Self::Job(step) => &step.id,
            Self::Service(step) => &step.id,
        }
    }

    pub fn dependents(&self) -> &[String] {
        match self {
            Self::Job(step) => &step.dependents,
            Self::Service(step) => &step.dependents,
        }
    }
}

/// Step that expands a runtime collection into child steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    /// Literal array or a template string resolving to one
    pub collection: Value,
    pub template: Box<FanoutTemplate>,
    pub max_items: usize,
    pub max_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_results_as: Option<String>,
}

/// Tagged step variants composing a workflow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Job(JobStep),
    Service(ServiceStep),
    Fanout(FanoutStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Self::Job(step) => &step.id,
            Self::Service(step) => &step.id,
            Self::Fanout(step) => &step.id,
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Job(step) => &step.depends_on,
            Self::Service(step) => &step.depends_on,
            Self::Fanout(step) => &step.depends_on,
        }
    }

    pub fn produces(&self) -> &[AssetDeclaration] {
        match self {
            Self::Job(step) => &step.produces,
            _ => &[],
        }
    }

    pub fn consumes(&self) -> &[AssetDeclaration] {
        match self {
            Self::Job(step) => &step.consumes,
            _ => &[],
        }
    }
}

/// Directed edge in a persisted workflow DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
}

/// Validated DAG metadata persisted alongside a workflow definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDag {
    pub adjacency: BTreeMap<String, Vec<String>>,
    pub roots: Vec<String>,
    pub topological_order: Vec<String>,
    pub edges: Vec<DagEdge>,
}

/// Schedule-shaped trigger embedded in a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DefinitionTrigger {
    Manual,
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Value>,
        #[serde(default)]
        catch_up: bool,
    },
}

/// Event trigger spec embedded in a workflow definition; materialized
/// into a `WorkflowEventTrigger` record when the definition is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerSpec {
    pub name: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(default)]
    pub predicates: Vec<TriggerPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key_expression: Option<String>,
}

/// Registered workflow definition with its validated DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowDefinitionId,
    pub slug: String,
    pub name: String,
    pub version: u32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<DefinitionTrigger>,
    #[serde(default)]
    pub event_triggers: Vec<EventTriggerSpec>,
    #[serde(default)]
    pub parameters_schema: Value,
    #[serde(default)]
    pub default_parameters: Value,
    #[serde(default)]
    pub metadata: Value,
    pub dag: WorkflowDag,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == step_id)
    }

    /// Asset declarations produced anywhere in this workflow.
    pub fn produced_assets(&self) -> impl Iterator<Item = (&Step, &AssetDeclaration)> {
        self.steps
            .iter()
            .flat_map(|s| s.produces().iter().map(move |a| (s, a)))
    }

    /// Asset declarations consumed anywhere in this workflow.
    pub fn consumed_assets(&self) -> impl Iterator<Item = (&Step, &AssetDeclaration)> {
        self.steps
            .iter()
            .flat_map(|s| s.consumes().iter().map(move |a| (s, a)))
    }
}

/// Half-open window a scheduled occurrence covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Schedule occurrence details carried on a run's trigger payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTriggerInfo {
    pub id: ScheduleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub occurrence: DateTime<Utc>,
    pub window: ScheduleWindow,
    pub catch_up: bool,
}

/// Upstream provenance on an auto-materialized run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamAssetRef {
    pub asset_id: String,
    pub produced_at: DateTime<Utc>,
    pub run_id: WorkflowRunId,
    pub step_id: String,
}

/// What created a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunTrigger {
    #[serde(rename = "manual")]
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<String>,
    },
    #[serde(rename = "schedule")]
    Schedule { schedule: ScheduleTriggerInfo },
    #[serde(rename = "event")]
    Event {
        #[serde(rename = "triggerId")]
        trigger_id: TriggerId,
        #[serde(rename = "eventId")]
        event_id: String,
    },
    #[serde(rename = "auto-materialize")]
    AutoMaterialize {
        reason: String,
        upstream: UpstreamAssetRef,
        priority: i64,
    },
}

/// Per-step slice of a run's context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Value>,
}

/// Mutable context accumulated while a run executes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunContext {
    #[serde(default)]
    pub steps: BTreeMap<String, StepContext>,
    #[serde(default)]
    pub shared: BTreeMap<String, Value>,
}

/// Aggregated counters on a workflow run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

/// Retry counters on a workflow run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySummary {
    pub total_retries: u32,
    #[serde(default)]
    pub steps: BTreeMap<String, u32>,
}

/// One run of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub status: WorkflowRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_key: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub context: WorkflowRunContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<usize>,
    #[serde(default)]
    pub metrics: WorkflowRunMetrics,
    pub trigger: RunTrigger,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub retry_summary: RetrySummary,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted state of a single step within a run. Fan-out children use
/// the composite step id `<parent>:<template>:<1-based-index>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStep {
    pub id: WorkflowRunStepId,
    pub workflow_run_id: WorkflowRunId,
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_run_id: Option<JobRunId>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Cron schedule attached to a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: ScheduleId,
    pub workflow_definition_id: WorkflowDefinitionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 5-field or 6-field cron expression
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_window: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_window: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_materialized_window: Option<ScheduleWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catchup_cursor: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Predicate operator on a trigger predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "camelCase")]
pub enum PredicateOperator {
    Equals { value: Value },
    NotEquals { value: Value },
    In { values: Vec<Value> },
    NotIn { values: Vec<Value> },
    Exists,
    GreaterThan { value: f64 },
    LessThan { value: f64 },
    Matches { pattern: String },
}

/// Predicate evaluated against an inbound event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerPredicate {
    JsonPath {
        path: String,
        #[serde(flatten)]
        operator: PredicateOperator,
    },
}

/// Whether a trigger currently fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Disabled,
}

/// Event trigger attached to a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEventTrigger {
    pub id: TriggerId,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub name: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(default)]
    pub predicates: Vec<TriggerPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key_expression: Option<String>,
    pub status: TriggerStatus,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a trigger's decision for one inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Matched,
    Launched,
    Throttled,
    Failed,
    Skipped,
}

/// Audit record of a trigger's decision for one envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTriggerDelivery {
    pub id: DeliveryId,
    pub trigger_id: TriggerId,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub event_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<WorkflowRunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted record of a step producing an asset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMaterialization {
    pub id: MaterializationId,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub workflow_run_id: WorkflowRunId,
    pub workflow_run_step_id: WorkflowRunStepId,
    pub step_id: String,
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<AssetFreshness>,
    pub produced_at: DateTime<Utc>,
}

/// Health of a registered external service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// Registry row for an external service that service steps call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub slug: String,
    pub base_url: String,
    pub status: ServiceHealth,
    #[serde(default)]
    pub metadata: Value,
    pub updated_at: DateTime<Utc>,
}

/// Normalized return value of a job handler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl JobResult {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self { result: None },
            other => Self {
                result: Some(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_variants_round_trip() {
        let step: Step = serde_json::from_value(json!({
            "type": "job",
            "id": "extract",
            "jobSlug": "extract-orders",
            "dependsOn": ["seed"],
            "storeResultAs": "orders",
            "produces": [{"assetId": "orders.raw"}]
        }))
        .unwrap();

        assert_eq!(step.id(), "extract");
        assert_eq!(step.depends_on(), ["seed".to_string()]);
        assert_eq!(step.produces()[0].asset_id, "orders.raw");

        let encoded = serde_json::to_value(&step).unwrap();
        let decoded: Step = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, step);
    }

    #[test]
    fn header_value_spec_accepts_literal_and_secret() {
        let literal: HeaderValueSpec = serde_json::from_value(json!("application/json")).unwrap();
        assert_eq!(literal, HeaderValueSpec::Literal("application/json".into()));

        let secret: HeaderValueSpec = serde_json::from_value(json!({
            "secret": {"source": "env", "key": "SERVICE_TOKEN"},
            "prefix": "Bearer "
        }))
        .unwrap();
        match secret {
            HeaderValueSpec::Secret { secret, prefix } => {
                assert_eq!(secret.source, SecretSource::Env);
                assert_eq!(secret.key, "SERVICE_TOKEN");
                assert_eq!(prefix.as_deref(), Some("Bearer "));
            }
            _ => panic!("expected secret header value"),
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: Some(350),
            jitter: None,
        };

        assert_eq!(policy.delay_before_attempt(2).as_millis(), 100);
        assert_eq!(policy.delay_before_attempt(3).as_millis(), 200);
        assert_eq!(policy.delay_before_attempt(4).as_millis(), 350);
    }

    #[test]
    fn run_trigger_tags_match_wire_format() {
        let trigger = RunTrigger::Event {
            trigger_id: TriggerId::new(),
            event_id: "evt-1".to_string(),
        };
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value["type"], "event");
        assert!(value["triggerId"].is_string());

        let value = serde_json::to_value(RunTrigger::Manual { operator: None }).unwrap();
        assert_eq!(value["type"], "manual");
    }

    #[test]
    fn predicate_operator_flattens_next_to_path() {
        let predicate: TriggerPredicate = serde_json::from_value(json!({
            "type": "jsonPath",
            "path": "$.payload.region",
            "operator": "in",
            "values": ["us-east", "us-west"]
        }))
        .unwrap();

        let TriggerPredicate::JsonPath { path, operator } = predicate;
        assert_eq!(path, "$.payload.region");
        assert!(matches!(operator, PredicateOperator::In { .. }));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobRunStatus::Expired.is_terminal());
        assert!(!JobRunStatus::Running.is_terminal());
        assert!(WorkflowRunStatus::Canceled.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }
}
