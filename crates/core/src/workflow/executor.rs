//! Workflow run execution: ready-set dispatch over the validated DAG,
//! bounded parallelism, per-step retries, fan-out expansion, service
//! calls, asset recording, and cancellation.
//!
//! The executor is resumable: persisted terminal step statuses are
//! adopted on re-execution, and a terminal run is returned untouched.

use crate::error::{Error, Result};
use crate::events::{
    run_lifecycle_event_type, AssetProducedPayload, EventBus, EventEnvelope, RunLifecyclePayload,
    ASSET_PRODUCED,
};
use crate::job::runtime::{JobRuntime, WORKFLOW_BUNDLE_CONTEXT_KEY};
use crate::secrets::SecretStore;
use crate::services::invoke_service_step;
use crate::storage::records::RecordStore;
use crate::template::{expand_value, TemplateScope};
use crate::types::*;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct WorkflowExecutorConfig {
    /// Ready steps running in parallel across one run (>= 1)
    pub max_parallel_steps: usize,
}

impl Default for WorkflowExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
        }
    }
}

/// Everything a dispatched step task needs.
struct StepEnv {
    store: Arc<dyn RecordStore>,
    job_runtime: Arc<JobRuntime>,
    secrets: Arc<dyn SecretStore>,
    http: reqwest::Client,
}

/// Identity of the enclosing run, cloned into step tasks.
#[derive(Clone)]
struct RunInfo {
    run_id: WorkflowRunId,
    workflow_definition_id: WorkflowDefinitionId,
    partition_key: Option<String>,
}

/// Fan-out child identity.
#[derive(Clone)]
struct ChildMeta {
    parent_step_id: String,
    template_step_id: String,
    fanout_index: usize,
}

/// Result of one child step inside a fan-out.
struct ChildSummary {
    step_id: String,
    status: StepStatus,
    context_entry: StepContext,
    output: Option<Value>,
}

/// What a finished step task reports back to the run loop.
struct StepOutcome {
    step_id: String,
    status: StepStatus,
    error: Option<String>,
    context_entry: StepContext,
    output: Option<Value>,
    shared_writes: Vec<(String, Value)>,
    children: Vec<ChildSummary>,
    events: Vec<EventEnvelope>,
    retries: u32,
}

impl StepOutcome {
    fn failed(step_id: &str, attempt: u32, message: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            error: Some(message.clone()),
            context_entry: StepContext {
                status: Some(StepStatus::Failed),
                attempt,
                error: Some(message),
                ..Default::default()
            },
            output: None,
            shared_writes: Vec::new(),
            children: Vec::new(),
            events: Vec::new(),
            retries: attempt.saturating_sub(1),
        }
    }
}

/// Drives workflow runs to a terminal status.
pub struct WorkflowExecutor {
    env: Arc<StepEnv>,
    events: Arc<dyn EventBus>,
    config: WorkflowExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        job_runtime: Arc<JobRuntime>,
        secrets: Arc<dyn SecretStore>,
        events: Arc<dyn EventBus>,
        config: WorkflowExecutorConfig,
    ) -> Self {
        Self {
            env: Arc::new(StepEnv {
                store,
                job_runtime,
                secrets,
                http: reqwest::Client::new(),
            }),
            events,
            config,
        }
    }

    /// Transition a run to `canceled`; the executor refuses to start
    /// new steps once it observes the stored status.
    pub async fn cancel(&self, run_id: WorkflowRunId) -> Result<WorkflowRun> {
        let mut run = self
            .env
            .store
            .get_workflow_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("workflow run", run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.status = WorkflowRunStatus::Canceled;
        run.completed_at = Some(Utc::now());
        let run = self.env.store.save_workflow_run(run).await?;
        self.publish_lifecycle(&run);
        Ok(run)
    }

    /// Advance a run to a terminal status. Re-executing a terminal run
    /// is a no-op.
    pub async fn execute(&self, run_id: WorkflowRunId) -> Result<WorkflowRun> {
        let mut run = self
            .env
            .store
            .get_workflow_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("workflow run", run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let definition = self
            .env
            .store
            .get_workflow_definition(run.workflow_definition_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("workflow definition", run.workflow_definition_id)
            })?;

        if run.status == WorkflowRunStatus::Pending {
            run.status = WorkflowRunStatus::Running;
            run.started_at = Some(Utc::now());
        }

        let mut statuses: HashMap<String, StepStatus> = definition
            .steps
            .iter()
            .map(|s| (s.id().to_string(), StepStatus::Pending))
            .collect();

        // Resume: adopt terminal statuses from the run context, then
        // from persisted step records (records win).
        for (step_id, entry) in &run.context.steps {
            if let Some(status) = entry.status.filter(|s| s.is_terminal()) {
                if let Some(slot) = statuses.get_mut(step_id) {
                    *slot = status;
                }
            }
        }
        for record in self.env.store.list_run_steps(run_id).await? {
            if record.parent_step_id.is_some() {
                continue;
            }
            if record.status.is_terminal() {
                if let Some(slot) = statuses.get_mut(&record.step_id) {
                    *slot = record.status;
                }
                run.context
                    .steps
                    .entry(record.step_id.clone())
                    .or_insert_with(|| StepContext {
                        status: Some(record.status),
                        attempt: record.attempt,
                        result: record.output.clone(),
                        error: record.error_message.clone(),
                        ..Default::default()
                    });
            }
        }

        recompute_metrics(&mut run, &definition, &statuses);
        run = match self.save_or_observe_cancel(run).await? {
            SaveResult::Saved(run) => run,
            SaveResult::Canceled(stored) => return Ok(stored),
        };
        self.publish_lifecycle(&run);

        let topo_index: HashMap<&str, usize> = definition
            .dag
            .topological_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let run_info = RunInfo {
            run_id,
            workflow_definition_id: definition.id,
            partition_key: run.partition_key.clone(),
        };

        let mut in_flight: JoinSet<StepOutcome> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();

        loop {
            // Cancellation is observed between dispatches; in-flight
            // steps are drained but nothing new starts.
            if let Some(stored) = self.env.store.get_workflow_run(run_id).await? {
                if stored.status == WorkflowRunStatus::Canceled {
                    tracing::info!(run = %run_id, "run canceled; draining in-flight steps");
                    while in_flight.join_next().await.is_some() {}
                    return Ok(stored);
                }
            }

            let mut ready: Vec<&Step> = definition
                .steps
                .iter()
                .filter(|step| {
                    statuses[step.id()] == StepStatus::Pending
                        && !running.contains(step.id())
                        && step.depends_on().iter().all(|dep| {
                            matches!(
                                statuses.get(dep.as_str()),
                                Some(StepStatus::Succeeded) | Some(StepStatus::Skipped)
                            )
                        })
                })
                .collect();
            ready.sort_by_key(|s| topo_index.get(s.id()).copied().unwrap_or(usize::MAX));

            let capacity = self
                .config
                .max_parallel_steps
                .max(1)
                .saturating_sub(running.len());
            for step in ready.into_iter().take(capacity) {
                let step_id = step.id().to_string();
                statuses.insert(step_id.clone(), StepStatus::Running);
                running.insert(step_id.clone());
                run.current_step_id = Some(step_id.clone());
                run.current_step_index = topo_index.get(step_id.as_str()).copied();

                let scope_root = scope_root(&run, &definition);
                let env = self.env.clone();
                let info = run_info.clone();
                let step = step.clone();
                tracing::debug!(run = %run_id, step = %step_id, "dispatching step");
                in_flight.spawn(async move { run_step(env, info, step, scope_root).await });
            }

            if in_flight.is_empty() {
                break;
            }

            run = match self.save_or_observe_cancel(run).await? {
                SaveResult::Saved(run) => run,
                SaveResult::Canceled(stored) => {
                    while in_flight.join_next().await.is_some() {}
                    return Ok(stored);
                }
            };

            let outcome = match in_flight.join_next().await {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_error)) => {
                    // A panicking step task fails its step, not the
                    // whole process.
                    tracing::error!(run = %run_id, error = %join_error, "step task aborted");
                    continue;
                }
                None => break,
            };

            running.remove(&outcome.step_id);
            statuses.insert(outcome.step_id.clone(), outcome.status);
            self.apply_outcome(&mut run, &definition, &mut statuses, outcome)
                .await?;
            recompute_metrics(&mut run, &definition, &statuses);
        }

        let failed = statuses.values().any(|s| *s == StepStatus::Failed);
        run.status = if failed {
            WorkflowRunStatus::Failed
        } else {
            WorkflowRunStatus::Succeeded
        };
        if run.status == WorkflowRunStatus::Succeeded {
            run.output = Some(Value::Object(
                run.context
                    .shared
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, Value>>(),
            ));
        }
        run.current_step_id = None;
        run.current_step_index = None;
        run.completed_at = Some(Utc::now());
        recompute_metrics(&mut run, &definition, &statuses);

        let run = match self.save_or_observe_cancel(run).await? {
            SaveResult::Saved(run) => run,
            SaveResult::Canceled(stored) => return Ok(stored),
        };
        self.publish_lifecycle(&run);
        tracing::info!(run = %run_id, status = ?run.status, "workflow run finished");
        Ok(run)
    }

    async fn apply_outcome(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        statuses: &mut HashMap<String, StepStatus>,
        outcome: StepOutcome,
    ) -> Result<()> {
        run.context
            .steps
            .insert(outcome.step_id.clone(), outcome.context_entry);
        for (key, value) in outcome.shared_writes {
            run.context.shared.insert(key, value);
        }
        for child in outcome.children {
            run.context
                .steps
                .insert(child.step_id.clone(), child.context_entry);
        }
        if outcome.retries > 0 {
            run.retry_summary.total_retries += outcome.retries;
            run.retry_summary
                .steps
                .insert(outcome.step_id.clone(), outcome.retries);
        }

        if outcome.status == StepStatus::Failed {
            if run.error_message.is_none() {
                run.error_message = outcome.error.clone();
            }
            self.skip_dependents(run, definition, statuses, &outcome.step_id)
                .await?;
        }

        for event in outcome.events {
            self.events.publish(event);
        }
        Ok(())
    }

    /// Mark every transitive dependent that has not started as skipped.
    async fn skip_dependents(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        statuses: &mut HashMap<String, StepStatus>,
        failed_step_id: &str,
    ) -> Result<()> {
        let mut queue: VecDeque<&str> = VecDeque::from([failed_step_id]);
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(current) = queue.pop_front() {
            let Some(successors) = definition.dag.adjacency.get(current) else {
                continue;
            };
            for successor in successors {
                if !visited.insert(successor.as_str()) {
                    continue;
                }
                queue.push_back(successor.as_str());
                if statuses.get(successor.as_str()) == Some(&StepStatus::Pending) {
                    statuses.insert(successor.clone(), StepStatus::Skipped);
                    run.context.steps.insert(
                        successor.clone(),
                        StepContext {
                            status: Some(StepStatus::Skipped),
                            ..Default::default()
                        },
                    );
                    self.env
                        .store
                        .save_run_step(WorkflowRunStep {
                            id: WorkflowRunStepId::new(),
                            workflow_run_id: run.id,
                            step_id: successor.clone(),
                            status: StepStatus::Skipped,
                            attempt: 0,
                            job_run_id: None,
                            input: Value::Null,
                            output: None,
                            metrics: json!({}),
                            error_message: Some(format!(
                                "dependency '{failed_step_id}' failed"
                            )),
                            parent_step_id: None,
                            fanout_index: None,
                            template_step_id: None,
                            started_at: None,
                            completed_at: Some(Utc::now()),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Persist the working copy; a concurrent cancel wins the terminal
    /// transition and is surfaced instead of the store error.
    async fn save_or_observe_cancel(&self, run: WorkflowRun) -> Result<SaveResult> {
        let run_id = run.id;
        match self.env.store.save_workflow_run(run).await {
            Ok(run) => Ok(SaveResult::Saved(run)),
            Err(Error::Store(message)) => {
                if let Some(stored) = self.env.store.get_workflow_run(run_id).await? {
                    if stored.status == WorkflowRunStatus::Canceled {
                        return Ok(SaveResult::Canceled(stored));
                    }
                }
                Err(Error::Store(message))
            }
            Err(e) => Err(e),
        }
    }

    fn publish_lifecycle(&self, run: &WorkflowRun) {
        let payload = RunLifecyclePayload {
            workflow_definition_id: run.workflow_definition_id,
            workflow_run_id: run.id,
            status: run.status,
            error_message: run.error_message.clone(),
        };
        self.events.publish(EventEnvelope::new(
            run_lifecycle_event_type(run.status),
            serde_json::to_value(payload).unwrap_or(Value::Null),
        ));
    }
}

enum SaveResult {
    Saved(WorkflowRun),
    Canceled(WorkflowRun),
}

/// Merged run parameters: definition defaults under run overrides.
fn merged_parameters(definition: &WorkflowDefinition, run: &WorkflowRun) -> Value {
    let mut merged = match &definition.default_parameters {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(Map::new()),
    };
    if let (Some(target), Some(overrides)) = (merged.as_object_mut(), run.parameters.as_object()) {
        for (key, value) in overrides {
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Template scope visible to a step at dispatch time.
fn scope_root(run: &WorkflowRun, definition: &WorkflowDefinition) -> Value {
    let parameters = merged_parameters(definition, run);

    let mut steps = Map::new();
    for (step_id, entry) in &run.context.steps {
        let mut step_scope = Map::new();
        if let Some(result) = &entry.result {
            step_scope.insert("result".to_string(), result.clone());
        }
        if let Some(service) = &entry.service {
            step_scope.insert("response".to_string(), service.clone());
        }
        if let Some(assets) = &entry.assets {
            step_scope.insert("assets".to_string(), assets.clone());
        }
        steps.insert(step_id.clone(), Value::Object(step_scope));
    }

    json!({
        "parameters": parameters,
        "run": {
            "id": run.id,
            "parameters": parameters,
            "partitionKey": run.partition_key,
        },
        "steps": steps,
        "shared": run.context.shared,
    })
}

fn recompute_metrics(
    run: &mut WorkflowRun,
    definition: &WorkflowDefinition,
    statuses: &HashMap<String, StepStatus>,
) {
    let definition_ids: HashSet<&str> = definition.steps.iter().map(|s| s.id()).collect();
    let children: Vec<(&String, &StepContext)> = run
        .context
        .steps
        .iter()
        .filter(|(id, _)| !definition_ids.contains(id.as_str()))
        .collect();

    let mut metrics = WorkflowRunMetrics {
        total_steps: definition.steps.len() + children.len(),
        ..Default::default()
    };
    for status in statuses.values() {
        match status {
            StepStatus::Succeeded => metrics.completed_steps += 1,
            StepStatus::Failed => metrics.failed_steps += 1,
            StepStatus::Skipped => metrics.skipped_steps += 1,
            _ => {}
        }
    }
    for (_, entry) in children {
        match entry.status {
            Some(StepStatus::Succeeded) => metrics.completed_steps += 1,
            Some(StepStatus::Failed) => metrics.failed_steps += 1,
            Some(StepStatus::Skipped) => metrics.skipped_steps += 1,
            _ => {}
        }
    }
    run.metrics = metrics;
}

/// Entry point of a dispatched step task.
async fn run_step(env: Arc<StepEnv>, info: RunInfo, step: Step, scope_root: Value) -> StepOutcome {
    match step {
        Step::Job(step) => execute_job_step(&env, &info, &step, scope_root, None).await,
        Step::Service(step) => execute_service_step(&env, &info, &step, scope_root, None).await,
        Step::Fanout(step) => execute_fanout_step(env, info, step, scope_root).await,
    }
}

/// Upsert the persisted record for a step, reusing the record id
/// across attempts and resumes.
async fn persist_step_record(
    env: &StepEnv,
    info: &RunInfo,
    step_id: &str,
    child: Option<&ChildMeta>,
    mutate: impl FnOnce(&mut WorkflowRunStep),
) -> Result<WorkflowRunStep> {
    let mut record = match env.store.get_run_step(info.run_id, step_id).await? {
        Some(existing) => existing,
        None => WorkflowRunStep {
            id: WorkflowRunStepId::new(),
            workflow_run_id: info.run_id,
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            attempt: 0,
            job_run_id: None,
            input: Value::Null,
            output: None,
            metrics: json!({}),
            error_message: None,
            parent_step_id: child.map(|c| c.parent_step_id.clone()),
            fanout_index: child.map(|c| c.fanout_index),
            template_step_id: child.map(|c| c.template_step_id.clone()),
            started_at: None,
            completed_at: None,
        },
    };
    mutate(&mut record);
    env.store.save_run_step(record).await
}

async fn execute_job_step(
    env: &StepEnv,
    info: &RunInfo,
    step: &JobStep,
    mut scope_root: Value,
    child: Option<ChildMeta>,
) -> StepOutcome {
    let step_id = match &child {
        Some(meta) => format!(
            "{}:{}:{}",
            meta.parent_step_id,
            meta.template_step_id,
            meta.fanout_index + 1
        ),
        None => step.id.clone(),
    };

    // Inject consumed assets before parameter expansion.
    let mut consumed = Map::new();
    for declaration in &step.consumes {
        let partition_filter = declaration
            .partitioning
            .as_ref()
            .and(info.partition_key.as_deref());
        match env
            .store
            .latest_materialization(&declaration.asset_id, partition_filter)
            .await
        {
            Ok(Some(materialization)) => {
                consumed.insert(
                    declaration.asset_id.clone(),
                    json!({
                        "payload": materialization.payload,
                        "producedAt": materialization.produced_at,
                        "partitionKey": materialization.partition_key,
                        "workflowRunId": materialization.workflow_run_id,
                    }),
                );
            }
            Ok(None) => {}
            Err(e) => {
                return StepOutcome::failed(&step_id, 1, e.to_string());
            }
        }
    }
    let assets_value = if consumed.is_empty() {
        None
    } else {
        Some(Value::Object(consumed))
    };
    if let Some(assets) = &assets_value {
        scope_root["steps"][&step_id]["assets"] = assets.clone();
    }

    let scope = TemplateScope::new(scope_root);
    let parameters = match &step.parameters {
        Some(parameters) => expand_value(parameters, &scope),
        None => json!({}),
    };

    let definition = match env.store.get_job_definition_by_slug(&step.job_slug).await {
        Ok(Some(definition)) => definition,
        Ok(None) => {
            return StepOutcome::failed(
                &step_id,
                1,
                format!("job definition '{}' is not registered", step.job_slug),
            );
        }
        Err(e) => return StepOutcome::failed(&step_id, 1, e.to_string()),
    };

    // A pinned bundle (or a `latest` binding resolved now) rides along
    // in the job run context.
    let bundle_override = match resolve_step_bundle(env, step).await {
        Ok(value) => value,
        Err(e) => return StepOutcome::failed(&step_id, 1, e.to_string()),
    };

    let policy = step
        .retry_policy
        .clone()
        .or_else(|| definition.retry_policy.clone());
    let max_attempts = policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);

    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            if let Some(policy) = &policy {
                tokio::time::sleep(policy.delay_before_attempt(attempt)).await;
            }
        }

        let mut job_context = json!({
            "workflowRunId": info.run_id,
            "workflowStepId": step_id,
        });
        if let Some(bundle) = &bundle_override {
            job_context[WORKFLOW_BUNDLE_CONTEXT_KEY] = bundle.clone();
        }

        let job_run = JobRun {
            id: JobRunId::new(),
            job_definition_id: definition.id,
            status: JobRunStatus::Pending,
            parameters: parameters.clone(),
            result: None,
            error_message: None,
            metrics: json!({}),
            context: job_context,
            attempt,
            max_attempts: Some(max_attempts),
            timeout_ms: step.timeout_ms,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
        };
        let job_run = match env.store.create_job_run(job_run).await {
            Ok(run) => run,
            Err(e) => return StepOutcome::failed(&step_id, attempt, e.to_string()),
        };

        let input = json!({
            "jobSlug": step.job_slug,
            "parameters": parameters,
            "assets": assets_value,
            "timeoutMs": step.timeout_ms,
        });
        if let Err(e) = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
            record.status = StepStatus::Running;
            record.attempt = attempt;
            record.job_run_id = Some(job_run.id);
            record.input = input.clone();
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        })
        .await
        {
            return StepOutcome::failed(&step_id, attempt, e.to_string());
        }

        let finished = match env.job_runtime.execute_job_run(job_run.id).await {
            Ok(run) => run,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };

        if finished.status == JobRunStatus::Succeeded {
            let record = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
                record.status = StepStatus::Succeeded;
                record.output = finished.result.clone();
                record.metrics = json!({"job": finished.metrics});
                record.completed_at = Some(Utc::now());
            })
            .await;
            let record = match record {
                Ok(record) => record,
                Err(e) => return StepOutcome::failed(&step_id, attempt, e.to_string()),
            };

            let mut shared_writes = Vec::new();
            if let Some(key) = &step.store_result_as {
                shared_writes.push((
                    key.clone(),
                    finished.result.clone().unwrap_or(Value::Null),
                ));
            }

            let mut events = Vec::new();
            for declaration in &step.produces {
                let partition_key = declaration
                    .partitioning
                    .as_ref()
                    .and(info.partition_key.clone());
                let materialization = AssetMaterialization {
                    id: MaterializationId::new(),
                    workflow_definition_id: info.workflow_definition_id,
                    workflow_run_id: info.run_id,
                    workflow_run_step_id: record.id,
                    step_id: step_id.clone(),
                    asset_id: declaration.asset_id.clone(),
                    partition_key: partition_key.clone(),
                    payload: finished.result.clone().unwrap_or(Value::Null),
                    schema: declaration.schema.clone(),
                    freshness: declaration.freshness.clone(),
                    produced_at: Utc::now(),
                };
                if let Err(e) = env.store.append_materialization(materialization.clone()).await {
                    return StepOutcome::failed(&step_id, attempt, e.to_string());
                }
                let payload = AssetProducedPayload {
                    asset_id: declaration.asset_id.clone(),
                    workflow_definition_id: info.workflow_definition_id,
                    workflow_run_id: info.run_id,
                    workflow_run_step_id: record.id,
                    step_id: step_id.clone(),
                    produced_at: materialization.produced_at,
                    partition_key,
                    freshness: declaration.freshness.clone(),
                };
                events.push(EventEnvelope::new(
                    ASSET_PRODUCED,
                    serde_json::to_value(payload).unwrap_or(Value::Null),
                ));
            }

            return StepOutcome {
                step_id,
                status: StepStatus::Succeeded,
                error: None,
                context_entry: StepContext {
                    status: Some(StepStatus::Succeeded),
                    attempt,
                    result: finished.result.clone(),
                    assets: assets_value,
                    ..Default::default()
                },
                output: finished.result,
                shared_writes,
                children: Vec::new(),
                events,
                retries: attempt - 1,
            };
        }

        last_error = finished
            .error_message
            .clone()
            .unwrap_or_else(|| format!("job run ended {:?}", finished.status));
        tracing::warn!(
            step = %step_id,
            attempt,
            max_attempts,
            error = %last_error,
            "job step attempt failed"
        );
    }

    let _ = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
        record.status = StepStatus::Failed;
        record.attempt = max_attempts;
        record.error_message = Some(last_error.clone());
        record.completed_at = Some(Utc::now());
    })
    .await;

    StepOutcome::failed(&step_id, max_attempts, last_error)
}

/// Resolve a step's bundle pin. `latest` re-resolves at dispatch time
/// so each run observes the newest published version.
async fn resolve_step_bundle(env: &StepEnv, step: &JobStep) -> Result<Option<Value>> {
    let Some(bundle) = &step.bundle else {
        return Ok(None);
    };

    let version = match bundle.strategy {
        BundleStrategy::Pinned => bundle.version.ok_or_else(|| {
            Error::validation(format!(
                "step '{}' pins bundle '{}' without a version",
                step.id, bundle.slug
            ))
        })?,
        BundleStrategy::Latest => env
            .store
            .latest_bundle_version(&bundle.slug)
            .await?
            .map(|v| v.version)
            .ok_or_else(|| Error::BundleResolution {
                binding: bundle.slug.clone(),
                reason: "no published version to resolve 'latest'".to_string(),
            })?,
    };

    Ok(Some(json!({
        "slug": bundle.slug,
        "version": version,
        "exportName": bundle.export_name,
    })))
}

async fn execute_service_step(
    env: &StepEnv,
    info: &RunInfo,
    step: &ServiceStep,
    scope_root: Value,
    child: Option<ChildMeta>,
) -> StepOutcome {
    let step_id = match &child {
        Some(meta) => format!(
            "{}:{}:{}",
            meta.parent_step_id,
            meta.template_step_id,
            meta.fanout_index + 1
        ),
        None => step.id.clone(),
    };
    let scope = TemplateScope::new(scope_root);

    if let Err(e) = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
        record.status = StepStatus::Running;
        record.attempt = 1;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
    })
    .await
    {
        return StepOutcome::failed(&step_id, 1, e.to_string());
    }

    match invoke_service_step(&env.http, env.store.as_ref(), env.secrets.as_ref(), step, &scope)
        .await
    {
        Ok((outcome, input)) => {
            let capture = outcome.capture();
            let service_context = json!({
                "statusCode": outcome.status_code,
                "ok": outcome.ok,
                "body": outcome.body,
            });
            let _ = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
                record.status = StepStatus::Succeeded;
                record.attempt = outcome.attempts;
                record.input = input.clone();
                record.output = Some(capture.clone());
                record.metrics = json!({"service": {"statusCode": outcome.status_code}});
                record.completed_at = Some(Utc::now());
            })
            .await;

            let mut shared_writes = Vec::new();
            if let Some(key) = &step.store_response_as {
                shared_writes.push((key.clone(), capture.clone()));
            }

            StepOutcome {
                step_id,
                status: StepStatus::Succeeded,
                error: None,
                context_entry: StepContext {
                    status: Some(StepStatus::Succeeded),
                    attempt: outcome.attempts,
                    service: Some(service_context),
                    ..Default::default()
                },
                output: Some(capture),
                shared_writes,
                children: Vec::new(),
                events: Vec::new(),
                retries: outcome.attempts - 1,
            }
        }
        Err(e) => {
            let attempts = step
                .retry_policy
                .as_ref()
                .map(|p| p.max_attempts.max(1))
                .unwrap_or(1);
            let _ = persist_step_record(env, info, &step_id, child.as_ref(), |record| {
                record.status = StepStatus::Failed;
                record.attempt = attempts;
                record.error_message = Some(e.to_string());
                record.completed_at = Some(Utc::now());
            })
            .await;
            StepOutcome::failed(&step_id, attempts, e.to_string())
        }
    }
}

async fn execute_fanout_step(
    env: Arc<StepEnv>,
    info: RunInfo,
    step: FanoutStep,
    scope_root: Value,
) -> StepOutcome {
    let step_id = step.id.clone();
    let scope = TemplateScope::new(scope_root.clone());

    if let Err(e) = persist_step_record(&env, &info, &step_id, None, |record| {
        record.status = StepStatus::Running;
        record.attempt = 1;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
    })
    .await
    {
        return StepOutcome::failed(&step_id, 1, e.to_string());
    }

    let collection = expand_value(&step.collection, &scope);
    let Some(items) = collection.as_array().cloned() else {
        let message =
            format!("fan-out step '{step_id}' collection did not resolve to an array");
        let _ = persist_step_record(&env, &info, &step_id, None, |record| {
            record.status = StepStatus::Failed;
            record.error_message = Some(message.clone());
            record.completed_at = Some(Utc::now());
        })
        .await;
        return StepOutcome::failed(&step_id, 1, message);
    };

    // Over-limit fan-outs fail before any child is spawned.
    if items.len() > step.max_items {
        let message = format!(
            "fan-out step '{step_id}' collection size {} exceeds the limit of {}",
            items.len(),
            step.max_items
        );
        let _ = persist_step_record(&env, &info, &step_id, None, |record| {
            record.status = StepStatus::Failed;
            record.error_message = Some(message.clone());
            record.completed_at = Some(Utc::now());
        })
        .await;
        return StepOutcome::failed(&step_id, 1, message);
    }

    let semaphore = Arc::new(Semaphore::new(step.max_concurrency.max(1)));
    let mut children_tasks: JoinSet<(usize, StepOutcome)> = JoinSet::new();

    for (index, item) in items.iter().enumerate() {
        let mut child_scope = scope_root.clone();
        child_scope["item"] = item.clone();
        child_scope["fanout"] = json!({"index": index});

        let meta = ChildMeta {
            parent_step_id: step_id.clone(),
            template_step_id: step.template.id().to_string(),
            fanout_index: index,
        };
        let env = env.clone();
        let info = info.clone();
        let template = (*step.template).clone();
        let semaphore = semaphore.clone();

        children_tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let outcome = match template {
                FanoutTemplate::Job(job_step) => {
                    execute_job_step(&env, &info, &job_step, child_scope, Some(meta)).await
                }
                FanoutTemplate::Service(service_step) => {
                    execute_service_step(&env, &info, &service_step, child_scope, Some(meta)).await
                }
            };
            (index, outcome)
        });
    }

    let mut ordered: Vec<Option<StepOutcome>> = (0..items.len()).map(|_| None).collect();
    while let Some(joined) = children_tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => ordered[index] = Some(outcome),
            Err(join_error) => {
                tracing::error!(step = %step_id, error = %join_error, "fan-out child aborted");
            }
        }
    }

    let mut children = Vec::new();
    let mut aggregated = Vec::new();
    let mut shared_writes = Vec::new();
    let mut events = Vec::new();
    let mut first_failure: Option<String> = None;

    for (index, slot) in ordered.into_iter().enumerate() {
        let Some(outcome) = slot else {
            first_failure.get_or_insert(format!(
                "fan-out child {} of '{step_id}' aborted",
                index + 1
            ));
            continue;
        };
        if outcome.status == StepStatus::Failed && first_failure.is_none() {
            first_failure = outcome.error.clone();
        }
        aggregated.push(json!({
            "stepId": outcome.step_id,
            "status": outcome.status,
            "output": outcome.output,
        }));
        events.extend(outcome.events);
        shared_writes.extend(outcome.shared_writes);
        children.push(ChildSummary {
            step_id: outcome.step_id,
            status: outcome.status,
            context_entry: outcome.context_entry,
            output: outcome.output,
        });
    }

    let total_children = children.len();
    if let Some(key) = &step.store_results_as {
        shared_writes.push((key.clone(), Value::Array(aggregated)));
    }

    let status = if first_failure.is_some() {
        StepStatus::Failed
    } else {
        StepStatus::Succeeded
    };
    let output = json!({"totalChildren": total_children});
    let _ = persist_step_record(&env, &info, &step_id, None, |record| {
        record.status = status;
        record.output = Some(output.clone());
        record.error_message = first_failure.clone();
        record.completed_at = Some(Utc::now());
    })
    .await;

    StepOutcome {
        step_id: step_id.clone(),
        status,
        error: first_failure.clone(),
        context_entry: StepContext {
            status: Some(status),
            attempt: 1,
            result: Some(output.clone()),
            error: first_failure,
            ..Default::default()
        },
        output: Some(output),
        shared_writes,
        children,
        events,
        retries: 0,
    }
}
