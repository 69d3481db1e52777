//! Definition registration and manual run creation: the operations the
//! HTTP surface delegates to after auth.

use crate::error::{Error, Result};
use crate::launch::RunLauncher;
use crate::scheduler::parse_cron;
use crate::storage::records::RecordStore;
use crate::types::*;
use crate::workflow::dag::build_dag;
use crate::workflow::partition;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Operator-supplied body for creating or replacing a workflow definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinitionSpec {
    pub slug: String,
    pub name: String,
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
}

/// Operator-supplied body for creating or replacing a job definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinitionSpec {
    pub slug: String,
    pub name: String,
    pub runtime: JobRuntimeKind,
    pub entry_point: String,
    #[serde(default)]
    pub parameters_schema: Value,
    #[serde(default)]
    pub default_parameters: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub metadata: Value,
}

/// Validate and persist a job definition (upsert by slug).
pub async fn register_job(
    store: &dyn RecordStore,
    spec: JobDefinitionSpec,
) -> Result<JobDefinition> {
    if spec.entry_point.is_empty() {
        return Err(Error::validation("entryPoint must not be empty"));
    }
    if crate::bundle::manifest::BundleBinding::is_binding(&spec.entry_point) {
        // Surface malformed bindings at registration, not dispatch.
        crate::bundle::manifest::BundleBinding::parse(&spec.entry_point)?;
    }

    store
        .upsert_job_definition(JobDefinition {
            id: JobDefinitionId::new(),
            slug: spec.slug,
            name: spec.name,
            version: 1,
            runtime: spec.runtime,
            entry_point: spec.entry_point,
            parameters_schema: spec.parameters_schema,
            default_parameters: spec.default_parameters,
            timeout_ms: spec.timeout_ms,
            retry_policy: spec.retry_policy,
            metadata: spec.metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
}

/// Validate and persist a workflow definition, then materialize its
/// schedules and event triggers. Prior schedules and triggers of the
/// workflow are deactivated so the new definition version owns the
/// producer side.
pub async fn register_workflow(
    store: &dyn RecordStore,
    spec: WorkflowDefinitionSpec,
) -> Result<WorkflowDefinition> {
    let dag = build_dag(&spec.steps)?;

    for trigger in &spec.triggers {
        if let DefinitionTrigger::Schedule { cron, timezone, .. } = trigger {
            parse_cron(cron)?;
            if let Some(timezone) = timezone {
                timezone
                    .parse::<chrono_tz::Tz>()
                    .map_err(|_| Error::validation(format!("unknown timezone '{timezone}'")))?;
            }
        }
    }

    let definition = store
        .upsert_workflow_definition(WorkflowDefinition {
            id: WorkflowDefinitionId::new(),
            slug: spec.slug,
            name: spec.name,
            version: 1,
            steps: spec.steps,
            triggers: spec.triggers.clone(),
            event_triggers: spec.event_triggers.clone(),
            parameters_schema: spec.parameters_schema,
            default_parameters: spec.default_parameters,
            metadata: spec.metadata,
            dag,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await?;

    // Deactivate the previous version's schedules and triggers.
    for schedule in store.list_schedules().await? {
        if schedule.workflow_definition_id == definition.id && schedule.is_active {
            let mut schedule = schedule;
            schedule.is_active = false;
            store.put_schedule(schedule).await?;
        }
    }
    for trigger in store.list_triggers().await? {
        if trigger.workflow_definition_id == definition.id
            && trigger.status == TriggerStatus::Active
        {
            let mut trigger = trigger;
            trigger.status = TriggerStatus::Disabled;
            store.put_trigger(trigger).await?;
        }
    }

    for trigger in &spec.triggers {
        if let DefinitionTrigger::Schedule {
            cron,
            timezone,
            parameters,
            catch_up,
        } = trigger
        {
            let cron_schedule = parse_cron(cron)?;
            let next_run_at = cron_schedule
                .after(&Utc::now())
                .next()
                .map(|at| at.with_timezone(&Utc));
            store
                .put_schedule(Schedule {
                    id: ScheduleId::new(),
                    workflow_definition_id: definition.id,
                    name: Some(definition.name.clone()),
                    cron: cron.clone(),
                    timezone: timezone.clone(),
                    parameters: parameters.clone(),
                    start_window: None,
                    end_window: None,
                    catch_up: *catch_up,
                    next_run_at,
                    last_materialized_window: None,
                    catchup_cursor: None,
                    is_active: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await?;
        }
    }

    for (index, spec) in definition.event_triggers.iter().enumerate() {
        store
            .put_trigger(WorkflowEventTrigger {
                id: TriggerId::new(),
                workflow_definition_id: definition.id,
                name: spec.name.clone(),
                event_type: spec.event_type.clone(),
                event_source: spec.event_source.clone(),
                predicates: spec.predicates.clone(),
                parameter_template: spec.parameter_template.clone(),
                throttle_window_ms: spec.throttle_window_ms,
                throttle_count: spec.throttle_count,
                max_concurrency: spec.max_concurrency,
                idempotency_key_expression: spec.idempotency_key_expression.clone(),
                status: TriggerStatus::Active,
                version: definition.version,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;
        tracing::debug!(
            workflow = %definition.slug,
            trigger = %spec.name,
            index,
            "materialized event trigger"
        );
    }

    Ok(definition)
}

/// Body of `POST /workflows/{slug}/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualRunRequest {
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

/// Create and enqueue a manual run, enforcing partition validation for
/// partition-constrained outputs.
pub async fn create_manual_run(
    store: &dyn RecordStore,
    launcher: &dyn RunLauncher,
    slug: &str,
    request: ManualRunRequest,
) -> Result<WorkflowRun> {
    let definition = store
        .get_workflow_definition_by_slug(slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", slug))?;

    partition::validate_run_key(&definition, request.partition_key.as_deref())?;

    let run = store
        .create_workflow_run(WorkflowRun {
            id: WorkflowRunId::new(),
            workflow_definition_id: definition.id,
            status: WorkflowRunStatus::Pending,
            run_key: request.run_key,
            parameters: request.parameters.unwrap_or_else(|| json!({})),
            context: Default::default(),
            output: None,
            error_message: None,
            current_step_id: None,
            current_step_index: None,
            metrics: Default::default(),
            trigger: RunTrigger::Manual {
                operator: request.operator.clone(),
            },
            triggered_by: request.operator.unwrap_or_else(|| "manual".to_string()),
            partition_key: request.partition_key,
            retry_summary: Default::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
        .await?;

    launcher.enqueue(run.id).await?;
    Ok(run)
}

/// Create and enqueue a manual job run.
pub async fn create_manual_job_run(
    store: &dyn RecordStore,
    slug: &str,
    parameters: Option<Value>,
) -> Result<JobRun> {
    let definition = store
        .get_job_definition_by_slug(slug)
        .await?
        .ok_or_else(|| Error::not_found("job definition", slug))?;

    store
        .create_job_run(JobRun {
            id: JobRunId::new(),
            job_definition_id: definition.id,
            status: JobRunStatus::Pending,
            parameters: parameters.unwrap_or_else(|| json!({})),
            result: None,
            error_message: None,
            metrics: json!({}),
            context: json!({}),
            attempt: 1,
            max_attempts: None,
            timeout_ms: None,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
        })
        .await
}

/// Convenience wrapper for launch-through callers that hold `Arc`s.
pub async fn enqueue_manual_run(
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn RunLauncher>,
    slug: &str,
    request: ManualRunRequest,
) -> Result<WorkflowRun> {
    create_manual_run(store.as_ref(), launcher.as_ref(), slug, request).await
}
