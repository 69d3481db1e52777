use crate::error::{Error, Result};
use crate::storage::records::{AdvisoryLockGuard, AdvisoryLocks, RecordStore};
use crate::types::*;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const JOB_DEFINITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_definitions");
const BUNDLE_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("bundle_versions");
const JOB_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("job_runs");
const WORKFLOW_DEFINITIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("workflow_definitions");
const WORKFLOW_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_runs");
const WORKFLOW_RUN_STEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_run_steps");
const SCHEDULES: TableDefinition<&str, &[u8]> = TableDefinition::new("schedules");
const TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("event_triggers");
const DELIVERIES: TableDefinition<&str, &[u8]> = TableDefinition::new("trigger_deliveries");
const MATERIALIZATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("asset_materializations");
const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Embedded record store over redb: one table per entity, JSON values.
///
/// Writes go through short single-table transactions; secondary
/// lookups are in-memory scans, which is the intended scale for a
/// single-node deployment.
#[derive(Clone)]
pub struct RedbRecordStore {
    db: Arc<Database>,
    locks: AdvisoryLocks,
}

impl RedbRecordStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(|e| Error::store(e.to_string()))?;

        // Open every table once so later reads never race creation.
        let write_txn = db.begin_write().map_err(|e| Error::store(e.to_string()))?;
        {
            for table in [
                JOB_DEFINITIONS,
                BUNDLE_VERSIONS,
                JOB_RUNS,
                WORKFLOW_DEFINITIONS,
                WORKFLOW_RUNS,
                WORKFLOW_RUN_STEPS,
                SCHEDULES,
                TRIGGERS,
                DELIVERIES,
                MATERIALIZATIONS,
                SERVICES,
            ] {
                write_txn
                    .open_table(table)
                    .map_err(|e| Error::store(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::store(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            locks: AdvisoryLocks::new(),
        })
    }

    fn put_raw<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::store(e.to_string()))?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::store(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(table)
                .map_err(|e| Error::store(e.to_string()))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| Error::store(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    fn get_raw<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::store(e.to_string()))?;
        let table = read_txn
            .open_table(table)
            .map_err(|e| Error::store(e.to_string()))?;
        match table.get(key).map_err(|e| Error::store(e.to_string()))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value())
                    .map_err(|e| Error::store(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::store(e.to_string()))?;
        let table = read_txn
            .open_table(table)
            .map_err(|e| Error::store(e.to_string()))?;

        let mut values = Vec::new();
        for item in table.iter().map_err(|e| Error::store(e.to_string()))? {
            let (_key, value) = item.map_err(|e| Error::store(e.to_string()))?;
            values.push(
                serde_json::from_slice(value.value()).map_err(|e| Error::store(e.to_string()))?,
            );
        }
        Ok(values)
    }

    fn run_step_key(workflow_run_id: WorkflowRunId, step_id: &str) -> String {
        format!("{workflow_run_id}:{step_id}")
    }
}

#[async_trait::async_trait]
impl RecordStore for RedbRecordStore {
    async fn upsert_job_definition(&self, mut definition: JobDefinition) -> Result<JobDefinition> {
        if definition.slug.is_empty() || definition.slug != definition.slug.to_lowercase() {
            return Err(Error::validation(format!(
                "job slug '{}' must be non-empty lowercase",
                definition.slug
            )));
        }

        if let Some(existing) = self.get_job_definition_by_slug(&definition.slug).await? {
            definition.id = existing.id;
            definition.version = existing.version + 1;
            definition.created_at = existing.created_at;
        }
        definition.updated_at = Utc::now();

        self.put_raw(JOB_DEFINITIONS, &definition.slug.clone(), &definition)?;
        Ok(definition)
    }

    async fn get_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>> {
        let definitions: Vec<JobDefinition> = self.scan(JOB_DEFINITIONS)?;
        Ok(definitions.into_iter().find(|d| d.id == id))
    }

    async fn get_job_definition_by_slug(&self, slug: &str) -> Result<Option<JobDefinition>> {
        self.get_raw(JOB_DEFINITIONS, slug)
    }

    async fn list_job_definitions(&self) -> Result<Vec<JobDefinition>> {
        let mut definitions: Vec<JobDefinition> = self.scan(JOB_DEFINITIONS)?;
        definitions.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(definitions)
    }

    async fn put_bundle_version(&self, version: JobBundleVersion) -> Result<JobBundleVersion> {
        let key = version.key();
        if let Some(existing) = self
            .get_bundle_version(&version.bundle_slug, version.version)
            .await?
        {
            let frozen = existing.immutable
                && (existing.checksum != version.checksum
                    || serde_json::to_value(&existing.manifest).ok()
                        != serde_json::to_value(&version.manifest).ok());
            if frozen {
                return Err(Error::validation(format!(
                    "bundle version {key} is immutable"
                )));
            }
        }
        self.put_raw(BUNDLE_VERSIONS, &key, &version)?;
        Ok(version)
    }

    async fn get_bundle_version(
        &self,
        slug: &str,
        version: u32,
    ) -> Result<Option<JobBundleVersion>> {
        self.get_raw(BUNDLE_VERSIONS, &format!("{slug}@{version}"))
    }

    async fn latest_bundle_version(&self, slug: &str) -> Result<Option<JobBundleVersion>> {
        let versions: Vec<JobBundleVersion> = self.scan(BUNDLE_VERSIONS)?;
        Ok(versions
            .into_iter()
            .filter(|v| v.bundle_slug == slug && v.status == BundleVersionStatus::Published)
            .max_by_key(|v| v.version))
    }

    async fn create_job_run(&self, run: JobRun) -> Result<JobRun> {
        self.put_raw(JOB_RUNS, &run.id.to_string(), &run)?;
        Ok(run)
    }

    async fn get_job_run(&self, id: JobRunId) -> Result<Option<JobRun>> {
        self.get_raw(JOB_RUNS, &id.to_string())
    }

    async fn save_job_run(&self, run: JobRun) -> Result<JobRun> {
        if let Some(existing) = self.get_job_run(run.id).await? {
            if existing.status.is_terminal() && existing.status != run.status {
                return Err(Error::store(format!(
                    "job run {} is already terminal ({:?})",
                    run.id, existing.status
                )));
            }
        }
        self.put_raw(JOB_RUNS, &run.id.to_string(), &run)?;
        Ok(run)
    }

    async fn upsert_workflow_definition(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        if definition.slug.is_empty() {
            return Err(Error::validation("workflow slug must be non-empty"));
        }

        if let Some(existing) = self
            .get_workflow_definition_by_slug(&definition.slug)
            .await?
        {
            definition.id = existing.id;
            definition.version = existing.version + 1;
            definition.created_at = existing.created_at;
        }
        definition.updated_at = Utc::now();

        self.put_raw(WORKFLOW_DEFINITIONS, &definition.slug.clone(), &definition)?;
        Ok(definition)
    }

    async fn get_workflow_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>> {
        let definitions: Vec<WorkflowDefinition> = self.scan(WORKFLOW_DEFINITIONS)?;
        Ok(definitions.into_iter().find(|d| d.id == id))
    }

    async fn get_workflow_definition_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<WorkflowDefinition>> {
        self.get_raw(WORKFLOW_DEFINITIONS, slug)
    }

    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<WorkflowDefinition> = self.scan(WORKFLOW_DEFINITIONS)?;
        definitions.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(definitions)
    }

    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        if let Some(run_key) = &run.run_key {
            let existing: Vec<WorkflowRun> = self.scan(WORKFLOW_RUNS)?;
            if let Some(previous) = existing.into_iter().find(|r| {
                r.workflow_definition_id == run.workflow_definition_id
                    && r.run_key.as_deref() == Some(run_key.as_str())
            }) {
                return Ok(previous);
            }
        }
        self.put_raw(WORKFLOW_RUNS, &run.id.to_string(), &run)?;
        Ok(run)
    }

    async fn get_workflow_run(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>> {
        self.get_raw(WORKFLOW_RUNS, &id.to_string())
    }

    async fn save_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        if let Some(existing) = self.get_workflow_run(run.id).await? {
            if existing.status.is_terminal() && existing.status != run.status {
                return Err(Error::store(format!(
                    "workflow run {} is already terminal ({:?})",
                    run.id, existing.status
                )));
            }
        }
        self.put_raw(WORKFLOW_RUNS, &run.id.to_string(), &run)?;
        Ok(run)
    }

    async fn list_workflow_runs(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
    ) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self.scan(WORKFLOW_RUNS)?;
        runs.retain(|r| r.workflow_definition_id == workflow_definition_id);
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn find_live_run(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
        partition_key: Option<&str>,
    ) -> Result<Option<WorkflowRun>> {
        let runs = self.list_workflow_runs(workflow_definition_id).await?;
        Ok(runs.into_iter().find(|r| {
            !r.status.is_terminal() && r.partition_key.as_deref() == partition_key
        }))
    }

    async fn latest_succeeded_run(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
        partition_key: Option<&str>,
    ) -> Result<Option<WorkflowRun>> {
        let runs = self.list_workflow_runs(workflow_definition_id).await?;
        Ok(runs.into_iter().find(|r| {
            r.status == WorkflowRunStatus::Succeeded
                && r.partition_key.as_deref() == partition_key
        }))
    }

    async fn count_live_runs_for_trigger(&self, trigger_id: TriggerId) -> Result<usize> {
        let runs: Vec<WorkflowRun> = self.scan(WORKFLOW_RUNS)?;
        Ok(runs
            .iter()
            .filter(|r| {
                !r.status.is_terminal()
                    && matches!(&r.trigger, RunTrigger::Event { trigger_id: id, .. } if *id == trigger_id)
            })
            .count())
    }

    async fn save_run_step(&self, step: WorkflowRunStep) -> Result<WorkflowRunStep> {
        let key = Self::run_step_key(step.workflow_run_id, &step.step_id);
        self.put_raw(WORKFLOW_RUN_STEPS, &key, &step)?;
        Ok(step)
    }

    async fn get_run_step(
        &self,
        workflow_run_id: WorkflowRunId,
        step_id: &str,
    ) -> Result<Option<WorkflowRunStep>> {
        self.get_raw(
            WORKFLOW_RUN_STEPS,
            &Self::run_step_key(workflow_run_id, step_id),
        )
    }

    async fn list_run_steps(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> Result<Vec<WorkflowRunStep>> {
        let mut steps: Vec<WorkflowRunStep> = self.scan(WORKFLOW_RUN_STEPS)?;
        steps.retain(|s| s.workflow_run_id == workflow_run_id);
        steps.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.step_id.cmp(&b.step_id))
        });
        Ok(steps)
    }

    async fn put_schedule(&self, mut schedule: Schedule) -> Result<Schedule> {
        schedule.updated_at = Utc::now();
        self.put_raw(SCHEDULES, &schedule.id.to_string(), &schedule)?;
        Ok(schedule)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        self.get_raw(SCHEDULES, &id.to_string())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.scan(SCHEDULES)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .scan::<Schedule>(SCHEDULES)?
            .into_iter()
            .filter(|s| s.is_active && s.next_run_at.map(|at| at <= now).unwrap_or(false))
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn put_trigger(&self, trigger: WorkflowEventTrigger) -> Result<WorkflowEventTrigger> {
        self.put_raw(TRIGGERS, &trigger.id.to_string(), &trigger)?;
        Ok(trigger)
    }

    async fn get_trigger(&self, id: TriggerId) -> Result<Option<WorkflowEventTrigger>> {
        self.get_raw(TRIGGERS, &id.to_string())
    }

    async fn list_triggers(&self) -> Result<Vec<WorkflowEventTrigger>> {
        self.scan(TRIGGERS)
    }

    async fn list_active_triggers_for_event(
        &self,
        event_type: &str,
        source: Option<&str>,
    ) -> Result<Vec<WorkflowEventTrigger>> {
        let triggers: Vec<WorkflowEventTrigger> = self.scan(TRIGGERS)?;
        Ok(triggers
            .into_iter()
            .filter(|t| {
                t.status == TriggerStatus::Active
                    && t.event_type == event_type
                    && t.event_source
                        .as_deref()
                        .map(|s| Some(s) == source)
                        .unwrap_or(true)
            })
            .collect())
    }

    async fn save_delivery(
        &self,
        mut delivery: WorkflowTriggerDelivery,
    ) -> Result<WorkflowTriggerDelivery> {
        delivery.updated_at = Utc::now();
        self.put_raw(DELIVERIES, &delivery.id.to_string(), &delivery)?;
        Ok(delivery)
    }

    async fn list_deliveries_for_trigger(
        &self,
        trigger_id: TriggerId,
    ) -> Result<Vec<WorkflowTriggerDelivery>> {
        let mut deliveries: Vec<WorkflowTriggerDelivery> = self.scan(DELIVERIES)?;
        deliveries.retain(|d| d.trigger_id == trigger_id);
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }

    async fn count_launched_deliveries_since(
        &self,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Result<usize> {
        let deliveries = self.list_deliveries_for_trigger(trigger_id).await?;
        Ok(deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Launched && d.updated_at >= since)
            .count())
    }

    async fn find_launched_delivery_by_key(
        &self,
        trigger_id: TriggerId,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowTriggerDelivery>> {
        let deliveries = self.list_deliveries_for_trigger(trigger_id).await?;
        Ok(deliveries.into_iter().find(|d| {
            d.status == DeliveryStatus::Launched
                && d.idempotency_key.as_deref() == Some(idempotency_key)
        }))
    }

    async fn append_materialization(
        &self,
        materialization: AssetMaterialization,
    ) -> Result<AssetMaterialization> {
        self.put_raw(
            MATERIALIZATIONS,
            &materialization.id.to_string(),
            &materialization,
        )?;
        Ok(materialization)
    }

    async fn latest_materialization(
        &self,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>> {
        let materializations: Vec<AssetMaterialization> = self.scan(MATERIALIZATIONS)?;
        Ok(materializations
            .into_iter()
            .filter(|m| {
                m.asset_id == asset_id
                    && partition_key
                        .map(|key| m.partition_key.as_deref() == Some(key))
                        .unwrap_or(true)
            })
            .max_by_key(|m| m.produced_at))
    }

    async fn asset_history(
        &self,
        asset_id: &str,
        limit: usize,
    ) -> Result<Vec<AssetMaterialization>> {
        let mut materializations: Vec<AssetMaterialization> = self.scan(MATERIALIZATIONS)?;
        materializations.retain(|m| m.asset_id == asset_id);
        materializations.sort_by(|a, b| b.produced_at.cmp(&a.produced_at));
        materializations.truncate(limit);
        Ok(materializations)
    }

    async fn asset_partitions(&self, asset_id: &str) -> Result<Vec<String>> {
        let materializations: Vec<AssetMaterialization> = self.scan(MATERIALIZATIONS)?;
        let mut partitions: Vec<String> = materializations
            .into_iter()
            .filter(|m| m.asset_id == asset_id)
            .filter_map(|m| m.partition_key)
            .collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    async fn put_service(&self, mut service: ServiceRecord) -> Result<ServiceRecord> {
        service.updated_at = Utc::now();
        self.put_raw(SERVICES, &service.slug.clone(), &service)?;
        Ok(service)
    }

    async fn get_service(&self, slug: &str) -> Result<Option<ServiceRecord>> {
        self.get_raw(SERVICES, slug)
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.scan(SERVICES)
    }

    fn try_advisory_lock(&self, key: &str) -> Option<AdvisoryLockGuard> {
        self.locks.try_lock(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::manifest::BundleManifest;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, RedbRecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbRecordStore::new(dir.path().join("records.redb")).unwrap();
        (dir, store)
    }

    fn job_definition(slug: &str) -> JobDefinition {
        JobDefinition {
            id: JobDefinitionId::new(),
            slug: slug.to_string(),
            name: slug.to_string(),
            version: 1,
            runtime: JobRuntimeKind::Node,
            entry_point: "handlers.run".to_string(),
            parameters_schema: json!({}),
            default_parameters: json!({}),
            timeout_ms: None,
            retry_policy: None,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_by_slug_bumps_version_and_keeps_id() {
        let (_dir, store) = store();

        let first = store
            .upsert_job_definition(job_definition("send-report"))
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let mut second = job_definition("send-report");
        second.name = "Send report v2".to_string();
        let second = store.upsert_job_definition(second).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn rejects_uppercase_job_slug() {
        let (_dir, store) = store();
        let result = store.upsert_job_definition(job_definition("Send-Report")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn terminal_job_run_cannot_regress() {
        let (_dir, store) = store();
        let definition = store
            .upsert_job_definition(job_definition("noop"))
            .await
            .unwrap();

        let mut run = JobRun {
            id: JobRunId::new(),
            job_definition_id: definition.id,
            status: JobRunStatus::Succeeded,
            parameters: json!({}),
            result: None,
            error_message: None,
            metrics: json!({}),
            context: json!({}),
            attempt: 1,
            max_attempts: None,
            timeout_ms: None,
            scheduled_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            last_heartbeat_at: None,
        };
        store.create_job_run(run.clone()).await.unwrap();

        run.status = JobRunStatus::Running;
        assert!(store.save_job_run(run).await.is_err());
    }

    #[tokio::test]
    async fn immutable_bundle_version_is_frozen() {
        let (_dir, store) = store();
        let version = JobBundleVersion {
            bundle_slug: "reporting".to_string(),
            version: 3,
            manifest: BundleManifest {
                name: "reporting".to_string(),
                version: "3.0.0".to_string(),
                entry: "index.js".to_string(),
                capabilities: vec![],
                metadata: None,
            },
            checksum: "aa".repeat(32),
            artifact_storage: BundleArtifactStorage::Local,
            artifact_path: "reporting/3.tgz".to_string(),
            immutable: true,
            status: BundleVersionStatus::Published,
            published_at: Utc::now(),
        };
        store.put_bundle_version(version.clone()).await.unwrap();

        let mut tampered = version.clone();
        tampered.checksum = "bb".repeat(32);
        assert!(store.put_bundle_version(tampered).await.is_err());

        // Re-publishing identical bytes is benign.
        store.put_bundle_version(version).await.unwrap();
    }

    #[tokio::test]
    async fn run_key_creates_are_idempotent() {
        let (_dir, store) = store();
        let workflow_id = WorkflowDefinitionId::new();

        let make_run = || WorkflowRun {
            id: WorkflowRunId::new(),
            workflow_definition_id: workflow_id,
            status: WorkflowRunStatus::Pending,
            run_key: Some("nightly-2025-10-21".to_string()),
            parameters: json!({}),
            context: Default::default(),
            output: None,
            error_message: None,
            current_step_id: None,
            current_step_index: None,
            metrics: Default::default(),
            trigger: RunTrigger::Manual { operator: None },
            triggered_by: "operator".to_string(),
            partition_key: None,
            retry_summary: Default::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let first = store.create_workflow_run(make_run()).await.unwrap();
        let second = store.create_workflow_run(make_run()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn definition_round_trip_preserves_steps_and_dag() {
        let (_dir, store) = store();

        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "job", "id": "a", "jobSlug": "job-a"},
            {"type": "job", "id": "b", "jobSlug": "job-b", "dependsOn": ["a"]}
        ]))
        .unwrap();
        let dag = crate::workflow::dag::build_dag(&steps).unwrap();

        let definition = WorkflowDefinition {
            id: WorkflowDefinitionId::new(),
            slug: "wf1".to_string(),
            name: "wf1".to_string(),
            version: 1,
            steps: steps.clone(),
            triggers: vec![],
            event_triggers: vec![],
            parameters_schema: json!({}),
            default_parameters: json!({}),
            metadata: json!({}),
            dag,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = store.upsert_workflow_definition(definition).await.unwrap();
        let loaded = store
            .get_workflow_definition_by_slug("wf1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(loaded.steps, stored.steps);
        assert_eq!(loaded.dag, stored.dag);
        assert_eq!(loaded.dag.topological_order, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn latest_materialization_filters_by_partition() {
        let (_dir, store) = store();
        let base = AssetMaterialization {
            id: MaterializationId::new(),
            workflow_definition_id: WorkflowDefinitionId::new(),
            workflow_run_id: WorkflowRunId::new(),
            workflow_run_step_id: WorkflowRunStepId::new(),
            step_id: "emit".to_string(),
            asset_id: "orders.daily".to_string(),
            partition_key: Some("2025-10-20".to_string()),
            payload: json!({"rows": 10}),
            schema: None,
            freshness: None,
            produced_at: Utc::now() - chrono::Duration::minutes(5),
        };
        store.append_materialization(base.clone()).await.unwrap();

        let mut newer = base.clone();
        newer.id = MaterializationId::new();
        newer.partition_key = Some("2025-10-21".to_string());
        newer.payload = json!({"rows": 20});
        newer.produced_at = Utc::now();
        store.append_materialization(newer).await.unwrap();

        let latest = store
            .latest_materialization("orders.daily", Some("2025-10-20"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.payload["rows"], 10);

        let partitions = store.asset_partitions("orders.daily").await.unwrap();
        assert_eq!(partitions, vec!["2025-10-20", "2025-10-21"]);
    }
}
