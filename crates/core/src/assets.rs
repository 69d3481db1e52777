//! Asset lineage reactions: when an upstream asset is produced, find
//! downstream workflows that consume it and declare an
//! auto-materializing output, and enqueue partition-aware runs.
//!
//! Per `(workflow, partition)` the materializer debounces stale events
//! and suppresses new runs while one is already pending or running.

use crate::error::{Error, Result};
use crate::events::{AssetProducedPayload, EventBus, EventEnvelope, ASSET_PRODUCED};
use crate::launch::RunLauncher;
use crate::storage::records::RecordStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type DebounceKey = (WorkflowDefinitionId, Option<String>);

pub struct AssetMaterializer {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn RunLauncher>,
    last_seen: Mutex<HashMap<DebounceKey, DateTime<Utc>>>,
}

impl AssetMaterializer {
    pub fn new(store: Arc<dyn RecordStore>, launcher: Arc<dyn RunLauncher>) -> Self {
        Self {
            store,
            launcher,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// React to one `asset.produced` envelope. Returns the ids of runs
    /// that were enqueued.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<Vec<WorkflowRunId>> {
        if envelope.event_type != ASSET_PRODUCED {
            return Ok(Vec::new());
        }
        let payload: AssetProducedPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| Error::store(format!("malformed asset.produced payload: {e}")))?;

        let mut launched = Vec::new();
        for definition in self.store.list_workflow_definitions().await? {
            // A workflow reacting to its own output would requeue
            // itself forever.
            if definition.id == payload.workflow_definition_id {
                continue;
            }
            let Some(priority) = auto_materialize_priority(&definition, &payload.asset_id) else {
                continue;
            };

            let key: DebounceKey = (definition.id, payload.partition_key.clone());
            if self.is_stale(&key, payload.produced_at) {
                tracing::debug!(
                    workflow = %definition.slug,
                    asset = %payload.asset_id,
                    "dropping stale asset event"
                );
                continue;
            }

            if let Some(live) = self
                .store
                .find_live_run(definition.id, payload.partition_key.as_deref())
                .await?
            {
                // The in-flight run will observe the new upstream.
                tracing::debug!(
                    workflow = %definition.slug,
                    run = %live.id,
                    "suppressing auto-materialization while a run is live"
                );
                continue;
            }

            let parameters = match self
                .store
                .latest_succeeded_run(definition.id, payload.partition_key.as_deref())
                .await?
            {
                Some(previous) => previous.parameters,
                None => definition.default_parameters.clone(),
            };

            let run = self
                .store
                .create_workflow_run(WorkflowRun {
                    id: WorkflowRunId::new(),
                    workflow_definition_id: definition.id,
                    status: WorkflowRunStatus::Pending,
                    run_key: None,
                    parameters,
                    context: Default::default(),
                    output: None,
                    error_message: None,
                    current_step_id: None,
                    current_step_index: None,
                    metrics: Default::default(),
                    trigger: RunTrigger::AutoMaterialize {
                        reason: "upstream-update".to_string(),
                        upstream: UpstreamAssetRef {
                            asset_id: payload.asset_id.clone(),
                            produced_at: payload.produced_at,
                            run_id: payload.workflow_run_id,
                            step_id: payload.step_id.clone(),
                        },
                        priority,
                    },
                    triggered_by: "asset-materializer".to_string(),
                    partition_key: payload.partition_key.clone(),
                    retry_summary: Default::default(),
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                })
                .await?;
            self.launcher.enqueue(run.id).await?;
            tracing::info!(
                workflow = %definition.slug,
                run = %run.id,
                asset = %payload.asset_id,
                partition = ?payload.partition_key,
                "auto-materializing downstream workflow"
            );
            launched.push(run.id);
        }
        Ok(launched)
    }

    /// Record the event timestamp for the key; older events are stale.
    fn is_stale(&self, key: &DebounceKey, produced_at: DateTime<Utc>) -> bool {
        let mut last_seen = self.last_seen.lock().unwrap();
        match last_seen.get(key) {
            Some(previous) if *previous > produced_at => true,
            _ => {
                last_seen.insert(key.clone(), produced_at);
                false
            }
        }
    }
}

/// Downstream linkage: the workflow consumes the asset somewhere and
/// produces at least one asset with `autoMaterialize.onUpstreamUpdate`.
/// Returns the declared priority.
fn auto_materialize_priority(definition: &WorkflowDefinition, asset_id: &str) -> Option<i64> {
    let consumes = definition
        .consumed_assets()
        .any(|(_, declaration)| declaration.asset_id == asset_id);
    if !consumes {
        return None;
    }
    definition
        .produced_assets()
        .filter_map(|(_, declaration)| declaration.auto_materialize.as_ref())
        .find(|auto| auto.on_upstream_update)
        .map(|auto| auto.priority)
}

/// Subscribe a materializer to the event bus.
pub fn start_worker(
    materializer: Arc<AssetMaterializer>,
    bus: Arc<dyn EventBus>,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if envelope.event_type != ASSET_PRODUCED {
                        continue;
                    }
                    if let Err(e) = materializer.handle_event(&envelope).await {
                        tracing::error!(event = %envelope.id, error = %e, "asset event handling failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "asset materializer lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::RecordingRunLauncher;
    use crate::storage::RedbRecordStore;
    use crate::workflow::dag::build_dag;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RedbRecordStore>,
        launcher: Arc<RecordingRunLauncher>,
        materializer: AssetMaterializer,
        upstream: WorkflowDefinition,
        downstream: WorkflowDefinition,
    }

    async fn seed_definition(
        store: &RedbRecordStore,
        slug: &str,
        steps: serde_json::Value,
        default_parameters: serde_json::Value,
    ) -> WorkflowDefinition {
        let steps: Vec<Step> = serde_json::from_value(steps).unwrap();
        let dag = build_dag(&steps).unwrap();
        store
            .upsert_workflow_definition(WorkflowDefinition {
                id: WorkflowDefinitionId::new(),
                slug: slug.to_string(),
                name: slug.to_string(),
                version: 1,
                steps,
                triggers: vec![],
                event_triggers: vec![],
                parameters_schema: json!({}),
                default_parameters,
                metadata: json!({}),
                dag,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());

        let upstream = seed_definition(
            &store,
            "upstream",
            json!([{
                "type": "job",
                "id": "emit",
                "jobSlug": "emit",
                "produces": [{"assetId": "asset.a"}]
            }]),
            json!({}),
        )
        .await;

        let downstream = seed_definition(
            &store,
            "downstream",
            json!([{
                "type": "job",
                "id": "derive",
                "jobSlug": "derive",
                "consumes": [{"assetId": "asset.a", "partitioning": {"type": "timeWindow", "granularity": "minute"}}],
                "produces": [{
                    "assetId": "asset.b",
                    "autoMaterialize": {"onUpstreamUpdate": true, "priority": 5}
                }]
            }]),
            json!({"reportsDir": "/default/reports"}),
        )
        .await;

        let materializer = AssetMaterializer::new(store.clone(), launcher.clone());
        Fixture {
            _dir: dir,
            store,
            launcher,
            materializer,
            upstream,
            downstream,
        }
    }

    fn produced_event(fixture: &Fixture, partition_key: Option<&str>) -> EventEnvelope {
        let payload = AssetProducedPayload {
            asset_id: "asset.a".to_string(),
            workflow_definition_id: fixture.upstream.id,
            workflow_run_id: WorkflowRunId::new(),
            workflow_run_step_id: WorkflowRunStepId::new(),
            step_id: "emit".to_string(),
            produced_at: Utc::now(),
            partition_key: partition_key.map(|s| s.to_string()),
            freshness: None,
        };
        EventEnvelope::new(ASSET_PRODUCED, serde_json::to_value(payload).unwrap())
    }

    #[tokio::test]
    async fn launches_downstream_run_with_partition_and_priority() {
        let fixture = fixture().await;

        let launched = fixture
            .materializer
            .handle_event(&produced_event(&fixture, Some("2025-10-21T14:40")))
            .await
            .unwrap();

        assert_eq!(launched.len(), 1);
        let run = fixture
            .store
            .get_workflow_run(launched[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.triggered_by, "asset-materializer");
        assert_eq!(run.partition_key.as_deref(), Some("2025-10-21T14:40"));
        match &run.trigger {
            RunTrigger::AutoMaterialize {
                reason,
                upstream,
                priority,
            } => {
                assert_eq!(reason, "upstream-update");
                assert_eq!(upstream.asset_id, "asset.a");
                assert_eq!(*priority, 5);
            }
            other => panic!("expected auto-materialize trigger, got {other:?}"),
        }
        assert_eq!(run.parameters["reportsDir"], "/default/reports");
        assert_eq!(fixture.launcher.ids(), launched);
    }

    #[tokio::test]
    async fn reuses_parameters_from_the_latest_succeeded_partition_run() {
        let fixture = fixture().await;

        fixture
            .store
            .create_workflow_run(WorkflowRun {
                id: WorkflowRunId::new(),
                workflow_definition_id: fixture.downstream.id,
                status: WorkflowRunStatus::Succeeded,
                run_key: None,
                parameters: json!({"reportsDir": "/custom/reports", "siteFilter": "site-42"}),
                context: Default::default(),
                output: None,
                error_message: None,
                current_step_id: None,
                current_step_index: None,
                metrics: Default::default(),
                trigger: RunTrigger::Manual { operator: None },
                triggered_by: "operator".to_string(),
                partition_key: Some("2025-10-21T14:40".to_string()),
                retry_summary: Default::default(),
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        let launched = fixture
            .materializer
            .handle_event(&produced_event(&fixture, Some("2025-10-21T14:40")))
            .await
            .unwrap();

        let run = fixture
            .store
            .get_workflow_run(launched[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.parameters["reportsDir"], "/custom/reports");
        assert_eq!(run.parameters["siteFilter"], "site-42");
    }

    #[tokio::test]
    async fn suppresses_while_a_run_is_live_for_the_partition() {
        let fixture = fixture().await;

        let first = fixture
            .materializer
            .handle_event(&produced_event(&fixture, Some("2025-10-21T14:40")))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // The launched run is still pending; repeated upstream events
        // for the same partition do nothing.
        let second = fixture
            .materializer
            .handle_event(&produced_event(&fixture, Some("2025-10-21T14:40")))
            .await
            .unwrap();
        assert!(second.is_empty());

        // A different partition is unaffected.
        let other = fixture
            .materializer
            .handle_event(&produced_event(&fixture, Some("2025-10-21T14:41")))
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn stale_events_are_debounced_per_key() {
        let fixture = fixture().await;

        let fresh = produced_event(&fixture, Some("2025-10-21T14:40"));
        let mut stale = produced_event(&fixture, Some("2025-10-21T14:40"));
        let mut payload: AssetProducedPayload =
            serde_json::from_value(stale.payload.clone()).unwrap();
        payload.produced_at = Utc::now() - ChronoDuration::minutes(10);
        stale.payload = serde_json::to_value(payload).unwrap();

        assert_eq!(fixture.materializer.handle_event(&fresh).await.unwrap().len(), 1);
        assert!(fixture.materializer.handle_event(&stale).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrelated_assets_do_not_launch_runs() {
        let fixture = fixture().await;
        let mut event = produced_event(&fixture, None);
        let mut payload: AssetProducedPayload =
            serde_json::from_value(event.payload.clone()).unwrap();
        payload.asset_id = "asset.unrelated".to_string();
        event.payload = serde_json::to_value(payload).unwrap();

        assert!(fixture.materializer.handle_event(&event).await.unwrap().is_empty());
    }
}
