use crate::bundle::manifest::BundleBinding;
use crate::bundle::{AcquiredBundle, BundleCache};
use crate::error::{Error, Result};
use crate::job::registry::{HandlerRegistry, JobHandler};
use crate::sandbox::{SandboxHost, SandboxLaunch, SandboxRunner};
use crate::secrets::SecretStore;
use crate::storage::records::RecordStore;
use crate::types::{JobBundleVersion, JobDefinition, JobRun, JobRunId, JobRunStatus, SecretRef};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Key a workflow executor uses to pin a bundle onto a job run.
pub const WORKFLOW_BUNDLE_CONTEXT_KEY: &str = "__workflowBundle";

/// Shallow-merge `patch` object fields into `target`.
fn merge_object(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => {
            if !patch.is_null() {
                *target = patch.clone();
            }
        }
    }
}

/// Handle a running handler uses to talk back to the runtime.
pub struct JobRunContext {
    store: Arc<dyn RecordStore>,
    secrets: Arc<dyn SecretStore>,
    run: tokio::sync::Mutex<JobRun>,
}

impl JobRunContext {
    fn new(store: Arc<dyn RecordStore>, secrets: Arc<dyn SecretStore>, run: JobRun) -> Self {
        Self {
            store,
            secrets,
            run: tokio::sync::Mutex::new(run),
        }
    }

    pub async fn snapshot(&self) -> JobRun {
        self.run.lock().await.clone()
    }

    /// Persist a partial update (`metrics`, `context`, `result`) and
    /// refresh the heartbeat plus the local view.
    pub async fn update(&self, patch: Value) -> Result<JobRun> {
        let mut run = self.run.lock().await;
        if let Some(metrics) = patch.get("metrics") {
            merge_object(&mut run.metrics, metrics);
        }
        if let Some(context) = patch.get("context") {
            merge_object(&mut run.context, context);
        }
        if let Some(result) = patch.get("result") {
            run.result = Some(result.clone());
        }
        run.last_heartbeat_at = Some(Utc::now());

        let saved = self.store.save_job_run(run.clone()).await?;
        *run = saved.clone();
        Ok(saved)
    }

    /// Timestamp-only liveness signal.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        run.last_heartbeat_at = Some(Utc::now());
        let saved = self.store.save_job_run(run.clone()).await?;
        *run = saved;
        Ok(())
    }

    pub fn logger(&self, message: &str, meta: Option<&Value>) {
        match meta {
            Some(meta) => tracing::info!(target: "weft::job", %message, %meta, "handler log"),
            None => tracing::info!(target: "weft::job", %message, "handler log"),
        }
    }

    pub fn resolve_secret(&self, secret: &SecretRef) -> Option<String> {
        self.secrets.resolve(secret)
    }
}

#[async_trait::async_trait]
impl SandboxHost for JobRunContext {
    async fn update(&self, patch: Value) -> Result<()> {
        JobRunContext::update(self, patch).await?;
        Ok(())
    }

    fn resolve_secret(&self, secret: &SecretRef) -> Option<String> {
        JobRunContext::resolve_secret(self, secret)
    }
}

#[derive(Debug, Clone)]
pub struct JobRuntimeConfig {
    pub default_timeout_ms: u64,
}

impl Default for JobRuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
        }
    }
}

enum ResolvedHandler {
    Static(Arc<dyn JobHandler>),
    Bundle(BundleBinding),
}

struct Completion {
    status: JobRunStatus,
    result: Option<Value>,
    error_message: Option<String>,
    metrics_patch: Value,
    context_patch: Value,
}

impl Completion {
    fn succeeded(result: Option<Value>) -> Self {
        Self {
            status: JobRunStatus::Succeeded,
            result,
            error_message: None,
            metrics_patch: json!({}),
            context_patch: json!({}),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: JobRunStatus::Failed,
            result: None,
            error_message: Some(message.clone()),
            metrics_patch: json!({}),
            context_patch: json!({"error": message}),
        }
    }
}

/// Resolves a handler for a job run and drives it to a terminal status.
pub struct JobRuntime {
    store: Arc<dyn RecordStore>,
    registry: Arc<HandlerRegistry>,
    bundle_cache: Arc<BundleCache>,
    sandbox: Arc<SandboxRunner>,
    secrets: Arc<dyn SecretStore>,
    config: JobRuntimeConfig,
}

impl JobRuntime {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<HandlerRegistry>,
        bundle_cache: Arc<BundleCache>,
        sandbox: Arc<SandboxRunner>,
        secrets: Arc<dyn SecretStore>,
        config: JobRuntimeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bundle_cache,
            sandbox,
            secrets,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Execute a job run to a terminal status and return the final record.
    pub async fn execute_job_run(&self, run_id: JobRunId) -> Result<JobRun> {
        let run = self
            .store
            .get_job_run(run_id)
            .await?
            .ok_or_else(|| Error::not_found("job run", run_id))?;

        let Some(definition) = self.store.get_job_definition(run.job_definition_id).await? else {
            let job_definition_id = run.job_definition_id;
            return self
                .finish_detached(
                    run,
                    Completion::failed(format!(
                        "job definition {} no longer exists",
                        job_definition_id
                    )),
                )
                .await;
        };

        if run.status.is_terminal() {
            return Ok(run);
        }

        let resolved = self.resolve_handler(&definition, &run);
        let Some(resolved) = resolved else {
            return self
                .finish_detached(
                    run,
                    Completion::failed(format!(
                        "no handler resolvable for job '{}'",
                        definition.slug
                    )),
                )
                .await;
        };

        let mut run = run;
        if run.status == JobRunStatus::Pending {
            run.status = JobRunStatus::Running;
            run.started_at = Some(Utc::now());
            run = self.store.save_job_run(run).await?;
        }

        let parameters = merged_parameters(&definition, &run);
        let timeout_ms = run
            .timeout_ms
            .or(definition.timeout_ms)
            .unwrap_or(self.config.default_timeout_ms);

        let ctx = Arc::new(JobRunContext::new(
            self.store.clone(),
            self.secrets.clone(),
            run,
        ));

        let completion = match resolved {
            ResolvedHandler::Static(handler) => {
                self.run_static(handler, ctx.clone(), parameters, timeout_ms)
                    .await
            }
            ResolvedHandler::Bundle(binding) => {
                self.run_bundle(&definition, binding, ctx.clone(), parameters, timeout_ms)
                    .await
            }
        };

        self.finish(ctx, completion).await
    }

    /// Resolution order: workflow-supplied bundle override, static
    /// handler, then the definition's bundle entry point.
    fn resolve_handler(&self, definition: &JobDefinition, run: &JobRun) -> Option<ResolvedHandler> {
        if let Some(override_value) = run.context.get(WORKFLOW_BUNDLE_CONTEXT_KEY) {
            if let Some(binding) = workflow_bundle_override(override_value) {
                return Some(ResolvedHandler::Bundle(binding));
            }
            tracing::warn!(
                job = %definition.slug,
                "ignoring malformed {WORKFLOW_BUNDLE_CONTEXT_KEY} context entry"
            );
        }

        if let Some(handler) = self.registry.get(&definition.slug) {
            return Some(ResolvedHandler::Static(handler));
        }

        if BundleBinding::is_binding(&definition.entry_point) {
            return BundleBinding::parse(&definition.entry_point)
                .ok()
                .map(ResolvedHandler::Bundle);
        }

        None
    }

    async fn run_static(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: Arc<JobRunContext>,
        parameters: Value,
        timeout_ms: u64,
    ) -> Completion {
        let started = std::time::Instant::now();
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            handler.run(ctx, parameters),
        )
        .await
        {
            Ok(Ok(result)) => Completion::succeeded(result.result),
            Ok(Err(e)) => {
                let mut completion = Completion::failed(e.to_string());
                completion.context_patch = json!({
                    "error": e.to_string(),
                    "errorName": error_name(&e),
                });
                completion
            }
            Err(_) => Completion {
                status: JobRunStatus::Expired,
                result: None,
                error_message: Some(format!(
                    "handler exceeded timeout of {timeout_ms}ms (elapsed {}ms)",
                    started.elapsed().as_millis()
                )),
                metrics_patch: json!({}),
                context_patch: json!({}),
            },
        }
    }

    async fn run_bundle(
        &self,
        definition: &JobDefinition,
        binding: BundleBinding,
        ctx: Arc<JobRunContext>,
        parameters: Value,
        timeout_ms: u64,
    ) -> Completion {
        let (bundle, version) = match self.acquire_bundle(&binding).await {
            Ok((bundle, version)) => (bundle, version),
            Err(acquire_error) => {
                // Bundle resolution keeps failing; a configured static
                // fallback for this slug takes over.
                if let Some(fallback) = self.registry.fallback(&definition.slug) {
                    tracing::warn!(
                        job = %definition.slug,
                        binding = %binding,
                        error = %acquire_error,
                        "bundle resolution failed; using static fallback"
                    );
                    let mut completion = self
                        .run_static(fallback, ctx, parameters, timeout_ms)
                        .await;
                    merge_object(&mut completion.metrics_patch, &json!({"bundleFallback": true}));
                    merge_object(
                        &mut completion.context_patch,
                        &json!({"bundleFallback": {
                            "binding": binding.to_string(),
                            "reason": acquire_error.to_string(),
                        }}),
                    );
                    return completion;
                }
                let mut completion = Completion::failed(acquire_error.to_string());
                completion.context_patch = json!({
                    "error": acquire_error.to_string(),
                    "errorName": "bundle_resolution",
                });
                return completion;
            }
        };

        let run_view = serde_json::to_value(ctx.snapshot().await).unwrap_or(Value::Null);
        let launch = SandboxLaunch {
            runtime: definition.runtime,
            bundle_dir: bundle.directory(),
            entry_file: bundle.entry_file(),
            manifest: bundle.manifest(),
            export_name: binding.export.clone(),
            parameters,
            run: run_view,
            timeout_ms,
        };

        let outcome = self.sandbox.execute(launch, ctx.as_ref()).await;
        bundle.release();

        match outcome {
            Ok(execution) => {
                let mut completion = match &execution.error {
                    Some(handler_error) => {
                        let mut completion = Completion::failed(handler_error.message.clone());
                        completion.context_patch = json!({
                            "error": handler_error.message,
                            "errorName": handler_error.name,
                            "stack": handler_error.stack,
                        });
                        completion
                    }
                    None => Completion::succeeded(execution.result.clone()),
                };

                merge_object(
                    &mut completion.metrics_patch,
                    &json!({"sandbox": {
                        "taskId": execution.task_id,
                        "durationMs": execution.duration_ms,
                        "truncatedLogCount": execution.truncated_log_count,
                        "resourceUsage": execution.resource_usage,
                    }}),
                );
                merge_object(
                    &mut completion.context_patch,
                    &json!({
                        "sandbox": {"logs": execution.logs},
                        "bundle": {"key": version.key(), "checksum": version.checksum},
                    }),
                );
                completion
            }
            Err(Error::SandboxTimeout { elapsed_ms }) => Completion {
                status: JobRunStatus::Expired,
                result: None,
                error_message: Some(format!("sandbox timed out after {elapsed_ms}ms")),
                metrics_patch: json!({"sandbox": {"durationMs": elapsed_ms}}),
                context_patch: json!({"bundle": {"key": version.key()}}),
            },
            Err(Error::SandboxCrash { code, signal }) => {
                let mut completion = Completion::failed(format!(
                    "sandbox exited abnormally (code: {code:?}, signal: {signal:?})"
                ));
                completion.context_patch = json!({
                    "exitCode": code,
                    "signal": signal,
                    "bundle": {"key": version.key()},
                });
                completion
            }
            Err(e) => Completion::failed(e.to_string()),
        }
    }

    /// Look up the bound bundle version, recovering via the latest
    /// published version when the pinned record is gone.
    async fn acquire_bundle(
        &self,
        binding: &BundleBinding,
    ) -> Result<(AcquiredBundle, JobBundleVersion)> {
        let pinned = self
            .store
            .get_bundle_version(&binding.slug, binding.version)
            .await?;

        if let Some(version) = pinned {
            match self.bundle_cache.acquire(&version).await {
                Ok(bundle) => return Ok((bundle, version)),
                Err(e) => {
                    tracing::warn!(binding = %binding, error = %e, "pinned bundle acquisition failed");
                }
            }
        }

        let latest = self
            .store
            .latest_bundle_version(&binding.slug)
            .await?
            .ok_or_else(|| Error::BundleResolution {
                binding: binding.to_string(),
                reason: "no published bundle version found".to_string(),
            })?;
        if latest.version == binding.version && pinned_is_same(&latest, binding) {
            // Nothing newer to recover with.
            return Err(Error::BundleResolution {
                binding: binding.to_string(),
                reason: "bundle artifact could not be materialized".to_string(),
            });
        }
        let bundle = self.bundle_cache.acquire(&latest).await?;
        Ok((bundle, latest))
    }

    async fn finish(&self, ctx: Arc<JobRunContext>, completion: Completion) -> Result<JobRun> {
        let mut run = ctx.snapshot().await;
        apply_completion(&mut run, completion);
        self.store.save_job_run(run).await
    }

    /// Completion path for runs that failed before a context existed.
    async fn finish_detached(&self, mut run: JobRun, completion: Completion) -> Result<JobRun> {
        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        apply_completion(&mut run, completion);
        self.store.save_job_run(run).await
    }
}

fn pinned_is_same(latest: &JobBundleVersion, binding: &BundleBinding) -> bool {
    latest.bundle_slug == binding.slug && latest.version == binding.version
}

fn apply_completion(run: &mut JobRun, completion: Completion) {
    run.status = completion.status;
    run.result = completion.result;
    run.error_message = completion.error_message;
    merge_object(&mut run.metrics, &completion.metrics_patch);
    merge_object(&mut run.context, &completion.context_patch);
    run.completed_at = Some(Utc::now());
}

fn merged_parameters(definition: &JobDefinition, run: &JobRun) -> Value {
    let mut merged = match &definition.default_parameters {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(Map::new()),
    };
    merge_object(&mut merged, &run.parameters);
    merged
}

fn workflow_bundle_override(value: &Value) -> Option<BundleBinding> {
    let slug = value.get("slug")?.as_str()?.to_string();
    let version = value.get("version")?.as_u64()? as u32;
    let export = value
        .get("exportName")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(BundleBinding {
        slug,
        version,
        export,
    })
}

fn error_name(error: &Error) -> &'static str {
    match error {
        Error::Validation(_) => "validation",
        Error::MissingDependency { .. } => "dependency_missing",
        Error::CycleDetected { .. } => "cycle_detected",
        Error::HandlerMissing { .. } => "handler_missing",
        Error::BundleResolution { .. } | Error::ChecksumMismatch { .. } => "bundle_resolution",
        Error::SandboxTimeout { .. } => "sandbox_timeout",
        Error::SandboxCrash { .. } => "sandbox_crash",
        Error::ServiceUnavailable { .. } => "service_unavailable",
        Error::ServiceHttp { .. } => "service_http_error",
        Error::Template(_) => "template_error",
        Error::Store(_) => "store_unavailable",
        Error::Throttled(_) => "throttled",
        Error::SkippedIdempotent(_) => "skipped_idempotent",
        Error::NotFound { .. } => "not_found",
        Error::Io(_) => "io",
        Error::Other(_) => "error",
    }
}
