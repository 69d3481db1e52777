use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Transactional record persistence the orchestration core runs against.
///
/// The store mediates all cross-worker state: definitions, runs, steps,
/// deliveries, schedules and materializations. Status-transitioning
/// writes (`save_job_run`, `save_workflow_run`) refuse to overwrite a
/// terminal status so a late writer cannot resurrect a finished run.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    // --- job definitions ---

    /// Insert or replace by slug; an existing slug keeps its id and
    /// bumps `version`.
    async fn upsert_job_definition(&self, definition: JobDefinition) -> Result<JobDefinition>;
    async fn get_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>>;
    async fn get_job_definition_by_slug(&self, slug: &str) -> Result<Option<JobDefinition>>;
    async fn list_job_definitions(&self) -> Result<Vec<JobDefinition>>;

    // --- bundle versions ---

    /// Refuses to replace a version marked immutable with different
    /// bytes (checksum) or manifest.
    async fn put_bundle_version(&self, version: JobBundleVersion) -> Result<JobBundleVersion>;
    async fn get_bundle_version(&self, slug: &str, version: u32)
        -> Result<Option<JobBundleVersion>>;
    /// Highest published version for a slug.
    async fn latest_bundle_version(&self, slug: &str) -> Result<Option<JobBundleVersion>>;

    // --- job runs ---

    async fn create_job_run(&self, run: JobRun) -> Result<JobRun>;
    async fn get_job_run(&self, id: JobRunId) -> Result<Option<JobRun>>;
    async fn save_job_run(&self, run: JobRun) -> Result<JobRun>;

    // --- workflow definitions ---

    async fn upsert_workflow_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition>;
    async fn get_workflow_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>>;
    async fn get_workflow_definition_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<WorkflowDefinition>>;
    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    // --- workflow runs ---

    /// Creating a run whose `(workflow, run_key)` already exists
    /// returns the existing run instead of a duplicate.
    async fn create_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;
    async fn get_workflow_run(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>>;
    async fn save_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;
    async fn list_workflow_runs(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
    ) -> Result<Vec<WorkflowRun>>;
    /// Any run in pending/running for the workflow and partition.
    async fn find_live_run(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
        partition_key: Option<&str>,
    ) -> Result<Option<WorkflowRun>>;
    /// Most recent succeeded run for the workflow and partition.
    async fn latest_succeeded_run(
        &self,
        workflow_definition_id: WorkflowDefinitionId,
        partition_key: Option<&str>,
    ) -> Result<Option<WorkflowRun>>;
    /// Live (pending/running) runs launched by an event trigger.
    async fn count_live_runs_for_trigger(&self, trigger_id: TriggerId) -> Result<usize>;

    // --- workflow run steps ---

    /// Upsert keyed on `(workflow_run_id, step_id)`.
    async fn save_run_step(&self, step: WorkflowRunStep) -> Result<WorkflowRunStep>;
    async fn get_run_step(
        &self,
        workflow_run_id: WorkflowRunId,
        step_id: &str,
    ) -> Result<Option<WorkflowRunStep>>;
    async fn list_run_steps(&self, workflow_run_id: WorkflowRunId)
        -> Result<Vec<WorkflowRunStep>>;

    // --- schedules ---

    async fn put_schedule(&self, schedule: Schedule) -> Result<Schedule>;
    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>>;
    async fn list_schedules(&self) -> Result<Vec<Schedule>>;
    /// Active schedules with `next_run_at <= now`, oldest first.
    async fn list_due_schedules(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>>;

    // --- event triggers ---

    async fn put_trigger(&self, trigger: WorkflowEventTrigger) -> Result<WorkflowEventTrigger>;
    async fn get_trigger(&self, id: TriggerId) -> Result<Option<WorkflowEventTrigger>>;
    async fn list_triggers(&self) -> Result<Vec<WorkflowEventTrigger>>;
    /// Active triggers matching an event type and, when the trigger
    /// pins one, the envelope source.
    async fn list_active_triggers_for_event(
        &self,
        event_type: &str,
        source: Option<&str>,
    ) -> Result<Vec<WorkflowEventTrigger>>;

    // --- trigger deliveries ---

    async fn save_delivery(
        &self,
        delivery: WorkflowTriggerDelivery,
    ) -> Result<WorkflowTriggerDelivery>;
    async fn list_deliveries_for_trigger(
        &self,
        trigger_id: TriggerId,
    ) -> Result<Vec<WorkflowTriggerDelivery>>;
    /// Launched deliveries for a trigger since the given instant.
    async fn count_launched_deliveries_since(
        &self,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Result<usize>;
    /// A prior launched delivery carrying the same idempotency key.
    async fn find_launched_delivery_by_key(
        &self,
        trigger_id: TriggerId,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowTriggerDelivery>>;

    // --- asset materializations ---

    async fn append_materialization(
        &self,
        materialization: AssetMaterialization,
    ) -> Result<AssetMaterialization>;
    /// Most recent materialization of an asset, partition-filtered
    /// when a key is given.
    async fn latest_materialization(
        &self,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> Result<Option<AssetMaterialization>>;
    async fn asset_history(
        &self,
        asset_id: &str,
        limit: usize,
    ) -> Result<Vec<AssetMaterialization>>;
    async fn asset_partitions(&self, asset_id: &str) -> Result<Vec<String>>;

    // --- service registry (reads; CRUD is owned elsewhere) ---

    async fn put_service(&self, service: ServiceRecord) -> Result<ServiceRecord>;
    async fn get_service(&self, slug: &str) -> Result<Option<ServiceRecord>>;
    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;

    // --- advisory locks ---

    /// Try-acquire semantics: returns a guard when this process now
    /// holds the key, `None` when another holder exists. Dropping the
    /// guard releases the key.
    fn try_advisory_lock(&self, key: &str) -> Option<AdvisoryLockGuard>;
}

/// Process-wide advisory lock namespace shared by store handles.
#[derive(Clone, Default)]
pub struct AdvisoryLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, key: &str) -> Option<AdvisoryLockGuard> {
        let mut held = self.held.lock().unwrap();
        if held.contains(key) {
            return None;
        }
        held.insert(key.to_string());
        Some(AdvisoryLockGuard {
            key: key.to_string(),
            held: self.held.clone(),
        })
    }
}

/// Held advisory lock; released on drop.
pub struct AdvisoryLockGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl AdvisoryLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        self.held.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_lock_is_exclusive_until_dropped() {
        let locks = AdvisoryLocks::new();

        let guard = locks.try_lock("schedule:abc").expect("first acquire");
        assert!(locks.try_lock("schedule:abc").is_none());
        assert!(locks.try_lock("schedule:other").is_some());

        drop(guard);
        assert!(locks.try_lock("schedule:abc").is_some());
    }
}
