use super::{ApiError, ApiResult};
use crate::config::AppState;
use crate::middleware::auth::{
    OperatorIdentity, SCOPE_JOBS_RUN, SCOPE_JOBS_WRITE, SCOPE_WORKFLOWS_RUN,
    SCOPE_WORKFLOWS_WRITE,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use weft_core::definitions::{
    create_manual_job_run, create_manual_run, register_job, register_workflow,
    JobDefinitionSpec, ManualRunRequest, WorkflowDefinitionSpec,
};
use weft_core::events::EventEnvelope;
use weft_core::launch::NoopRunLauncher;
use weft_core::scheduler::parse_cron;
use weft_core::{
    Error, JobRunId, Schedule, ScheduleId, WorkflowRunId,
};

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::from(Error::validation(format!("'{raw}' is not a valid id"))))
}

// --- workflow definitions ---

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let definitions = state.store.list_workflow_definitions().await?;
    Ok(Json(definitions))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_workflow_definition_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", &slug))?;
    Ok(Json(definition))
}

pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Json(spec): Json<WorkflowDefinitionSpec>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_WRITE)?;
    let definition = register_workflow(state.store.as_ref(), spec).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

/// `PATCH /api/workflows/{slug}` replaces the definition at a new version.
pub async fn replace_workflow(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Path(slug): Path<String>,
    Json(mut spec): Json<WorkflowDefinitionSpec>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_WRITE)?;
    spec.slug = slug;
    let definition = register_workflow(state.store.as_ref(), spec).await?;
    Ok(Json(definition))
}

// --- workflow runs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Return once the executor has driven the run to a terminal status.
    #[default]
    Inline,
    /// Return as soon as the run is enqueued.
    Enqueue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowBody {
    #[serde(flatten)]
    pub request: ManualRunRequest,
    #[serde(default)]
    pub mode: RunMode,
}

pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Path(slug): Path<String>,
    Json(body): Json<RunWorkflowBody>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_RUN)?;

    let mut request = body.request;
    if request.operator.is_none() && !identity.all_scopes {
        request.operator = Some(identity.subject.clone());
    }

    match body.mode {
        RunMode::Enqueue => {
            let run = create_manual_run(
                state.store.as_ref(),
                state.launcher.as_ref(),
                &slug,
                request,
            )
            .await?;
            Ok((StatusCode::ACCEPTED, Json(run)))
        }
        RunMode::Inline => {
            let run =
                create_manual_run(state.store.as_ref(), &NoopRunLauncher, &slug, request).await?;
            let run = state.executor.execute(run.id).await?;
            Ok((StatusCode::OK, Json(run)))
        }
    }
}

pub async fn get_workflow_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = WorkflowRunId(parse_id(&id)?);
    let run = state
        .store
        .get_workflow_run(id)
        .await?
        .ok_or_else(|| Error::not_found("workflow run", id))?;
    Ok(Json(run))
}

pub async fn get_workflow_run_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = WorkflowRunId(parse_id(&id)?);
    state
        .store
        .get_workflow_run(id)
        .await?
        .ok_or_else(|| Error::not_found("workflow run", id))?;
    let steps = state.store.list_run_steps(id).await?;
    Ok(Json(steps))
}

pub async fn cancel_workflow_run(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_RUN)?;
    let id = WorkflowRunId(parse_id(&id)?);
    let run = state.executor.cancel(id).await?;
    Ok(Json(run))
}

// --- assets ---

pub async fn list_assets(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_workflow_definition_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", &slug))?;

    let mut assets = Vec::new();
    for (step, declaration) in definition.produced_assets() {
        let latest = state
            .store
            .latest_materialization(&declaration.asset_id, None)
            .await?;
        assets.push(json!({
            "stepId": step.id(),
            "declaration": declaration,
            "latest": latest,
        }));
    }
    Ok(Json(assets))
}

fn declares_asset(
    definition: &weft_core::WorkflowDefinition,
    asset_id: &str,
) -> bool {
    definition
        .produced_assets()
        .any(|(_, declaration)| declaration.asset_id == asset_id)
}

pub async fn asset_history(
    State(state): State<Arc<AppState>>,
    Path((slug, asset_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_workflow_definition_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", &slug))?;
    if !declares_asset(&definition, &asset_id) {
        return Err(Error::not_found("asset", &asset_id).into());
    }
    let history = state.store.asset_history(&asset_id, 100).await?;
    Ok(Json(history))
}

pub async fn asset_partitions(
    State(state): State<Arc<AppState>>,
    Path((slug, asset_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_workflow_definition_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", &slug))?;
    if !declares_asset(&definition, &asset_id) {
        return Err(Error::not_found("asset", &asset_id).into());
    }
    let partitions = state.store.asset_partitions(&asset_id).await?;
    Ok(Json(partitions))
}

// --- jobs ---

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let definitions = state.store.list_job_definitions().await?;
    Ok(Json(definitions))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state
        .store
        .get_job_definition_by_slug(&slug)
        .await?
        .ok_or_else(|| Error::not_found("job definition", &slug))?;
    Ok(Json(definition))
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Json(spec): Json<JobDefinitionSpec>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_JOBS_WRITE)?;
    let definition = register_job(state.store.as_ref(), spec).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobBody {
    #[serde(default)]
    pub parameters: Option<Value>,
}

pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Path(slug): Path<String>,
    Json(body): Json<RunJobBody>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_JOBS_RUN)?;
    let run = create_manual_job_run(state.store.as_ref(), &slug, body.parameters).await?;
    let run = state.job_runtime.execute_job_run(run.id).await?;
    Ok(Json(run))
}

pub async fn get_job_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = JobRunId(parse_id(&id)?);
    let run = state
        .store
        .get_job_run(id)
        .await?
        .ok_or_else(|| Error::not_found("job run", id))?;
    Ok(Json(run))
}

// --- schedules ---

pub async fn list_schedules(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let schedules = state.store.list_schedules().await?;
    Ok(Json(schedules))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleBody {
    pub workflow_slug: String,
    #[serde(default)]
    pub name: Option<String>,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub catch_up: bool,
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    Json(body): Json<CreateScheduleBody>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_WRITE)?;

    let definition = state
        .store
        .get_workflow_definition_by_slug(&body.workflow_slug)
        .await?
        .ok_or_else(|| Error::not_found("workflow definition", &body.workflow_slug))?;

    let cron = parse_cron(&body.cron)?;
    if let Some(timezone) = &body.timezone {
        timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::validation(format!("unknown timezone '{timezone}'")))?;
    }
    let next_run_at = cron
        .after(&Utc::now())
        .next()
        .map(|at| at.with_timezone(&Utc));

    let schedule = state
        .store
        .put_schedule(Schedule {
            id: ScheduleId::new(),
            workflow_definition_id: definition.id,
            name: body.name,
            cron: body.cron,
            timezone: body.timezone,
            parameters: body.parameters,
            start_window: None,
            end_window: None,
            catch_up: body.catch_up,
            next_run_at,
            last_materialized_window: None,
            catchup_cursor: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

// --- triggers and inbound events ---

pub async fn list_triggers(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let triggers = state.store.list_triggers().await?;
    Ok(Json(triggers))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEventBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub occurred_at: Option<chrono::DateTime<Utc>>,
}

/// Expected `X-Weft-Signature` for an inbound envelope: hex sha256 of
/// `<secret>.<type>.<payload-json>`.
pub fn event_signature(secret: &str, event_type: &str, payload: &Value) -> String {
    use sha2::{Digest, Sha256};
    let payload = serde_json::to_string(payload).unwrap_or_default();
    hex::encode(Sha256::digest(format!("{secret}.{event_type}.{payload}")))
}

/// Publish an inbound envelope onto the bus; the trigger worker picks
/// it up asynchronously.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<OperatorIdentity>,
    headers: axum::http::HeaderMap,
    Json(body): Json<IngestEventBody>,
) -> ApiResult<impl IntoResponse> {
    identity.require(SCOPE_WORKFLOWS_RUN)?;

    if let Some(secret) = &state.config.signing_secret {
        let provided = headers
            .get("x-weft-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let expected = event_signature(secret, &body.event_type, &body.payload);
        if provided != expected {
            return Err(StatusCode::UNAUTHORIZED.into());
        }
    }

    let mut envelope = EventEnvelope::new(body.event_type, body.payload);
    if let Some(id) = body.id {
        envelope.id = id;
    }
    if let Some(source) = body.source {
        envelope = envelope.with_source(source);
    }
    if let Some(occurred_at) = body.occurred_at {
        envelope.occurred_at = occurred_at;
    }

    let id = envelope.id.clone();
    state.bus.publish(envelope);
    Ok((StatusCode::ACCEPTED, Json(json!({"eventId": id}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_signatures_are_deterministic_and_payload_sensitive() {
        let a = event_signature("secret", "order.created", &json!({"id": 1}));
        let b = event_signature("secret", "order.created", &json!({"id": 1}));
        let c = event_signature("secret", "order.created", &json!({"id": 2}));
        let d = event_signature("other", "order.created", &json!({"id": 1}));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
