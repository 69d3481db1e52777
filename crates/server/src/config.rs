use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use weft_core::assets::AssetMaterializer;
use weft_core::bundle::{BundleCache, BundleCacheConfig};
use weft_core::events::{BroadcastEventBus, EventBus};
use weft_core::job::{HandlerRegistry, JobRuntime, JobRuntimeConfig};
use weft_core::launch::{InlineRunLauncher, QueueRunLauncher, RunLauncher};
use weft_core::sandbox::{SandboxConfig, SandboxRunner};
use weft_core::scheduler::{SchedulerOptions, WorkflowScheduler};
use weft_core::secrets::InProcessSecretStore;
use weft_core::storage::artifacts::{
    FilesystemArtifactStore, ObjectArtifactStore, RoutingArtifactStore,
};
use weft_core::storage::{RecordStore, RedbRecordStore};
use weft_core::triggers::EventTriggerProcessor;
use weft_core::workflow::{WorkflowExecutor, WorkflowExecutorConfig};

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        )
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bundles: BundleConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub secrets: Vec<SeededSecret>,

    /// When set, producers enqueue only; an external worker loop
    /// drains pending runs (`WEFT_INLINE_QUEUE_DISABLED`).
    #[serde(default)]
    pub inline_queue_disabled: bool,

    /// `WEFT_SIGNING_SECRET`; when set, inbound event envelopes must
    /// carry a matching `X-Weft-Signature` header.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_records_file")]
    pub records_file: String,
}

fn default_records_file() -> String {
    "records.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            records_file: default_records_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// `WEFT_BUNDLE_STORAGE_ROOT`
    #[serde(default = "default_bundle_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// `WEFT_BUNDLE_CACHE_MAX_ENTRIES`
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// `WEFT_BUNDLE_CACHE_TTL_MS`
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

fn default_bundle_storage_root() -> String {
    "bundles".to_string()
}

fn default_cache_dir() -> String {
    "bundle-cache".to_string()
}

fn default_cache_max_entries() -> usize {
    32
}

fn default_cache_ttl_ms() -> u64 {
    30 * 60 * 1_000
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            storage_root: default_bundle_storage_root(),
            cache_dir: default_cache_dir(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_ms: default_cache_ttl_ms(),
            s3: None,
        }
    }
}

/// `WEFT_BUNDLE_S3_*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_scheduler_max_windows")]
    pub max_windows: usize,
    /// `WEFT_SCHEDULER_ADVISORY_LOCKS`
    #[serde(default = "default_true")]
    pub advisory_locks: bool,
}

fn default_scheduler_interval_ms() -> u64 {
    15_000
}

fn default_scheduler_batch_size() -> usize {
    20
}

fn default_scheduler_max_windows() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scheduler_interval_ms(),
            batch_size: default_scheduler_batch_size(),
            max_windows: default_scheduler_max_windows(),
            advisory_locks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
}

fn default_max_parallel_steps() -> usize {
    4
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
        }
    }
}

/// Operator bearer tokens with their scopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `WEFT_AUTH_DISABLED`; every request gets every scope.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub tokens: Vec<OperatorToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorToken {
    pub token: String,
    pub subject: String,
    pub scopes: Vec<String>,
}

/// Secret seeded into the in-process store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeededSecret {
    pub key: String,
    pub value: String,
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("creating data directory")?;

        let mut config: Self = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("reading configuration file")?;
            toml::from_str(&content).context("parsing configuration file")?
        } else {
            tracing::info!("configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                bundles: Default::default(),
                scheduler: Default::default(),
                executor: Default::default(),
                auth: Default::default(),
                secrets: Vec::new(),
                inline_queue_disabled: false,
                signing_secret: None,
            }
        };
        config.data_dir = data_dir;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over file configuration.
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("WEFT_SCHEDULER_ADVISORY_LOCKS") {
            self.scheduler.advisory_locks = enabled;
        }
        if let Ok(root) = std::env::var("WEFT_BUNDLE_STORAGE_ROOT") {
            self.bundles.storage_root = root;
        }
        if let Ok(value) = std::env::var("WEFT_BUNDLE_CACHE_MAX_ENTRIES") {
            if let Ok(parsed) = value.parse() {
                self.bundles.cache_max_entries = parsed;
            }
        }
        if let Ok(value) = std::env::var("WEFT_BUNDLE_CACHE_TTL_MS") {
            if let Ok(parsed) = value.parse() {
                self.bundles.cache_ttl_ms = parsed;
            }
        }
        if let Ok(bucket) = std::env::var("WEFT_BUNDLE_S3_BUCKET") {
            let mut s3 = self.bundles.s3.clone().unwrap_or(S3Config {
                bucket: bucket.clone(),
                region: None,
                endpoint: None,
                force_path_style: false,
            });
            s3.bucket = bucket;
            s3.region = std::env::var("WEFT_BUNDLE_S3_REGION").ok().or(s3.region);
            s3.endpoint = std::env::var("WEFT_BUNDLE_S3_ENDPOINT").ok().or(s3.endpoint);
            if let Some(force) = env_flag("WEFT_BUNDLE_S3_FORCE_PATH_STYLE") {
                s3.force_path_style = force;
            }
            self.bundles.s3 = Some(s3);
        }
        if let Ok(secret) = std::env::var("WEFT_SIGNING_SECRET") {
            self.signing_secret = Some(secret);
        }
        if let Some(disabled) = env_flag("WEFT_INLINE_QUEUE_DISABLED") {
            self.inline_queue_disabled = disabled;
        }
        if let Some(disabled) = env_flag("WEFT_AUTH_DISABLED") {
            self.auth.disabled = disabled;
        }
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.records_file)
    }

    fn resolve_dir(&self, configured: &str) -> PathBuf {
        let path = PathBuf::from(configured);
        if path.is_absolute() {
            path
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Application state shared across handlers and workers.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn RecordStore>,
    pub secrets: Arc<InProcessSecretStore>,
    pub registry: Arc<HandlerRegistry>,
    pub bus: Arc<dyn EventBus>,
    pub job_runtime: Arc<JobRuntime>,
    pub executor: Arc<WorkflowExecutor>,
    pub launcher: Arc<dyn RunLauncher>,
    pub scheduler: Arc<WorkflowScheduler>,
    pub trigger_processor: Arc<EventTriggerProcessor>,
    pub materializer: Arc<AssetMaterializer>,
    run_queue: std::sync::Mutex<
        Option<tokio::sync::mpsc::UnboundedReceiver<weft_core::WorkflowRunId>>,
    >,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<RedbRecordStore> = Arc::new(
            RedbRecordStore::new(config.records_path()).context("opening record store")?,
        );

        let secrets = Arc::new(InProcessSecretStore::new());
        for seeded in &config.secrets {
            secrets.seed(&seeded.key, &seeded.value);
        }

        let local_artifacts =
            FilesystemArtifactStore::new(config.resolve_dir(&config.bundles.storage_root))
                .context("creating bundle storage root")?;
        let remote_artifacts = match &config.bundles.s3 {
            Some(s3) => Some(build_s3_store(s3).context("configuring s3 artifact store")?),
            None => None,
        };
        let artifacts = Arc::new(RoutingArtifactStore::new(local_artifacts, remote_artifacts));

        let cache = Arc::new(
            BundleCache::new(
                BundleCacheConfig {
                    root: config.resolve_dir(&config.bundles.cache_dir),
                    max_entries: config.bundles.cache_max_entries,
                    ttl: Duration::from_millis(config.bundles.cache_ttl_ms),
                },
                artifacts,
            )
            .context("creating bundle cache")?,
        );

        let registry = Arc::new(HandlerRegistry::new());
        let job_runtime = Arc::new(JobRuntime::new(
            store.clone(),
            registry.clone(),
            cache,
            Arc::new(SandboxRunner::new(SandboxConfig::default())),
            secrets.clone(),
            JobRuntimeConfig::default(),
        ));

        let bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            job_runtime.clone(),
            secrets.clone(),
            bus.clone(),
            WorkflowExecutorConfig {
                max_parallel_steps: config.executor.max_parallel_steps,
            },
        ));

        let (launcher, run_queue): (Arc<dyn RunLauncher>, _) = if config.inline_queue_disabled {
            let (launcher, receiver) = QueueRunLauncher::new();
            (Arc::new(launcher), Some(receiver))
        } else {
            (Arc::new(InlineRunLauncher::new(executor.clone())), None)
        };

        let scheduler = Arc::new(WorkflowScheduler::new(
            store.clone(),
            launcher.clone(),
            SchedulerOptions {
                interval: Duration::from_millis(config.scheduler.interval_ms),
                batch_size: config.scheduler.batch_size,
                max_windows: config.scheduler.max_windows,
                use_advisory_locks: config.scheduler.advisory_locks,
            },
        ));

        let trigger_processor =
            Arc::new(EventTriggerProcessor::new(store.clone(), launcher.clone()));
        let materializer = Arc::new(AssetMaterializer::new(store.clone(), launcher.clone()));

        Ok(Self {
            config,
            store,
            secrets,
            registry,
            bus,
            job_runtime,
            executor,
            launcher,
            scheduler,
            trigger_processor,
            materializer,
            run_queue: std::sync::Mutex::new(run_queue),
        })
    }

    /// Start the background workers: scheduler, trigger processor,
    /// asset materializer, and (in queue mode) the run drainer.
    pub fn start_workers(self: &Arc<Self>) {
        self.scheduler.start();
        let _triggers =
            weft_core::triggers::start_worker(self.trigger_processor.clone(), self.bus.clone());
        let _assets =
            weft_core::assets::start_worker(self.materializer.clone(), self.bus.clone());

        if let Some(mut receiver) = self.run_queue.lock().unwrap().take() {
            let executor = self.executor.clone();
            tokio::spawn(async move {
                while let Some(run_id) = receiver.recv().await {
                    if let Err(e) = executor.execute(run_id).await {
                        tracing::error!(run = %run_id, error = %e, "queued run execution failed");
                    }
                }
            });
        }
    }
}

fn build_s3_store(s3: &S3Config) -> Result<ObjectArtifactStore> {
    let mut builder = object_store::aws::AmazonS3Builder::from_env()
        .with_bucket_name(&s3.bucket)
        .with_allow_http(true);
    if let Some(region) = &s3.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &s3.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if s3.force_path_style {
        builder = builder.with_virtual_hosted_style_request(false);
    }
    let store = builder.build().context("building s3 client")?;
    Ok(ObjectArtifactStore::new(Box::new(store), ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Defaults and env overrides share one test: the process
    // environment is global and parallel tests would race on it.
    #[test]
    fn defaults_apply_and_env_overrides_win() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(
            &dir.path().join("weft.toml"),
            dir.path().join("data"),
        )
        .unwrap();

        assert_eq!(config.storage.records_file, "records.redb");
        assert!(config.scheduler.advisory_locks);
        assert!(!config.auth.disabled);
        assert_eq!(config.executor.max_parallel_steps, 4);

        std::env::set_var("WEFT_SCHEDULER_ADVISORY_LOCKS", "off");
        std::env::set_var("WEFT_BUNDLE_CACHE_MAX_ENTRIES", "7");

        let config = ServerConfig::load(
            &dir.path().join("weft.toml"),
            dir.path().join("data"),
        )
        .unwrap();

        assert!(!config.scheduler.advisory_locks);
        assert_eq!(config.bundles.cache_max_entries, 7);

        std::env::remove_var("WEFT_SCHEDULER_ADVISORY_LOCKS");
        std::env::remove_var("WEFT_BUNDLE_CACHE_MAX_ENTRIES");
    }

    #[tokio::test]
    async fn app_state_wires_the_stack() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(
            &dir.path().join("weft.toml"),
            dir.path().to_path_buf(),
        )
        .unwrap();

        let state = AppState::new(config).unwrap();
        assert!(state.store.list_workflow_definitions().await.unwrap().is_empty());
    }
}
