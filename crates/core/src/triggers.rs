//! Event-trigger processing: predicate matching against inbound
//! envelopes, throttling, concurrency caps, idempotent replays, and
//! run launching. Every decision leaves a delivery record for audit.

use crate::error::{Error, Result};
use crate::events::{EventBus, EventEnvelope};
use crate::launch::RunLauncher;
use crate::storage::records::RecordStore;
use crate::template::{expand_string, expand_value, TemplateScope};
use crate::types::*;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Evaluate one predicate against the envelope scope.
fn predicate_holds(predicate: &TriggerPredicate, scope: &TemplateScope) -> bool {
    let TriggerPredicate::JsonPath { path, operator } = predicate;
    let resolved = scope.lookup(path);

    match operator {
        PredicateOperator::Exists => resolved.map(|v| !v.is_null()).unwrap_or(false),
        PredicateOperator::Equals { value } => resolved == Some(value),
        PredicateOperator::NotEquals { value } => resolved != Some(value),
        PredicateOperator::In { values } => resolved
            .map(|v| values.iter().any(|candidate| candidate == v))
            .unwrap_or(false),
        PredicateOperator::NotIn { values } => resolved
            .map(|v| !values.iter().any(|candidate| candidate == v))
            .unwrap_or(true),
        PredicateOperator::GreaterThan { value } => resolved
            .and_then(Value::as_f64)
            .map(|v| v > *value)
            .unwrap_or(false),
        PredicateOperator::LessThan { value } => resolved
            .and_then(Value::as_f64)
            .map(|v| v < *value)
            .unwrap_or(false),
        PredicateOperator::Matches { pattern } => {
            let Some(text) = resolved.and_then(Value::as_str) else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "invalid trigger predicate pattern");
                    false
                }
            }
        }
    }
}

/// All predicates must hold (logical AND).
pub fn predicates_match(predicates: &[TriggerPredicate], envelope_scope: &TemplateScope) -> bool {
    predicates
        .iter()
        .all(|predicate| predicate_holds(predicate, envelope_scope))
}

/// Matches inbound envelopes against active triggers and launches runs.
pub struct EventTriggerProcessor {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn RunLauncher>,
}

impl EventTriggerProcessor {
    pub fn new(store: Arc<dyn RecordStore>, launcher: Arc<dyn RunLauncher>) -> Self {
        Self { store, launcher }
    }

    /// Process one envelope against every matching active trigger.
    /// Returns the delivery records written along the way.
    pub async fn process_envelope(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<Vec<WorkflowTriggerDelivery>> {
        let triggers = self
            .store
            .list_active_triggers_for_event(&envelope.event_type, envelope.source.as_deref())
            .await?;
        if triggers.is_empty() {
            return Ok(Vec::new());
        }

        let scope = TemplateScope::new(
            serde_json::to_value(envelope).map_err(|e| Error::store(e.to_string()))?,
        );

        let mut deliveries = Vec::new();
        for trigger in triggers {
            if !predicates_match(&trigger.predicates, &scope) {
                continue;
            }

            let delivery = self.open_delivery(&trigger, envelope).await?;
            let delivery = match self.drive_delivery(&trigger, envelope, &scope, delivery).await {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(
                        trigger = %trigger.id,
                        event = %envelope.id,
                        error = %e,
                        "trigger delivery failed"
                    );
                    let mut failed = self
                        .store
                        .list_deliveries_for_trigger(trigger.id)
                        .await?
                        .into_iter()
                        .find(|d| d.event_id == envelope.id)
                        .unwrap_or_else(|| WorkflowTriggerDelivery {
                            id: DeliveryId::new(),
                            trigger_id: trigger.id,
                            workflow_definition_id: trigger.workflow_definition_id,
                            event_id: envelope.id.clone(),
                            status: DeliveryStatus::Failed,
                            attempts: 1,
                            workflow_run_id: None,
                            idempotency_key: None,
                            last_error: None,
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        });
                    failed.status = DeliveryStatus::Failed;
                    failed.last_error = Some(e.to_string());
                    self.store.save_delivery(failed).await?
                }
            };
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    async fn open_delivery(
        &self,
        trigger: &WorkflowEventTrigger,
        envelope: &EventEnvelope,
    ) -> Result<WorkflowTriggerDelivery> {
        self.store
            .save_delivery(WorkflowTriggerDelivery {
                id: DeliveryId::new(),
                trigger_id: trigger.id,
                workflow_definition_id: trigger.workflow_definition_id,
                event_id: envelope.id.clone(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                workflow_run_id: None,
                idempotency_key: None,
                last_error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
    }

    async fn drive_delivery(
        &self,
        trigger: &WorkflowEventTrigger,
        envelope: &EventEnvelope,
        scope: &TemplateScope,
        mut delivery: WorkflowTriggerDelivery,
    ) -> Result<WorkflowTriggerDelivery> {
        delivery.status = DeliveryStatus::Matched;
        delivery = self.store.save_delivery(delivery).await?;

        // Rolling-window throttle on successful launches.
        if let (Some(window_ms), Some(count)) = (trigger.throttle_window_ms, trigger.throttle_count)
        {
            let since = Utc::now() - ChronoDuration::milliseconds(window_ms as i64);
            let launched = self
                .store
                .count_launched_deliveries_since(trigger.id, since)
                .await?;
            if launched as u64 >= count {
                tracing::debug!(trigger = %trigger.id, launched, "trigger throttled by window");
                delivery.status = DeliveryStatus::Throttled;
                delivery.last_error = Some(format!(
                    "throttled: {launched} launches in the last {window_ms}ms"
                ));
                return self.store.save_delivery(delivery).await;
            }
        }

        // Live-run concurrency cap.
        if let Some(max_concurrency) = trigger.max_concurrency {
            let live = self.store.count_live_runs_for_trigger(trigger.id).await?;
            if live as u64 >= max_concurrency {
                tracing::debug!(trigger = %trigger.id, live, "trigger at max concurrency");
                delivery.status = DeliveryStatus::Throttled;
                delivery.last_error =
                    Some(format!("throttled: {live} live runs at the concurrency cap"));
                return self.store.save_delivery(delivery).await;
            }
        }

        // Idempotent replay detection.
        if let Some(expression) = &trigger.idempotency_key_expression {
            let key = expand_string(expression, scope);
            if !key.is_empty() {
                delivery.idempotency_key = Some(key.clone());
                if let Some(previous) = self
                    .store
                    .find_launched_delivery_by_key(trigger.id, &key)
                    .await?
                {
                    tracing::debug!(
                        trigger = %trigger.id,
                        key = %key,
                        previous = %previous.id,
                        "skipping idempotent replay"
                    );
                    delivery.status = DeliveryStatus::Skipped;
                    delivery.workflow_run_id = previous.workflow_run_id;
                    return self.store.save_delivery(delivery).await;
                }
            }
        }

        let definition = self
            .store
            .get_workflow_definition(trigger.workflow_definition_id)
            .await?
            .ok_or_else(|| {
                Error::not_found("workflow definition", trigger.workflow_definition_id)
            })?;

        let parameters = match &trigger.parameter_template {
            Some(template) => expand_value(template, scope),
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
                trigger: RunTrigger::Event {
                    trigger_id: trigger.id,
                    event_id: envelope.id.clone(),
                },
                triggered_by: "event-trigger".to_string(),
                partition_key: None,
                retry_summary: Default::default(),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            })
            .await?;
        self.launcher.enqueue(run.id).await?;

        delivery.status = DeliveryStatus::Launched;
        delivery.workflow_run_id = Some(run.id);
        delivery.attempts += 1;
        self.store.save_delivery(delivery).await
    }
}

/// Subscribe a processor to the event bus. The worker runs until the
/// returned handle is aborted.
pub fn start_worker(
    processor: Arc<EventTriggerProcessor>,
    bus: Arc<dyn EventBus>,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if let Err(e) = processor.process_envelope(&envelope).await {
                        tracing::error!(event = %envelope.id, error = %e, "envelope processing failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "trigger worker lagged behind the event bus");
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
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RedbRecordStore>,
        launcher: Arc<RecordingRunLauncher>,
        processor: EventTriggerProcessor,
        workflow: WorkflowDefinition,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());

        let steps: Vec<Step> =
            serde_json::from_value(json!([{"type": "job", "id": "only", "jobSlug": "noop"}]))
                .unwrap();
        let dag = build_dag(&steps).unwrap();
        let workflow = store
            .upsert_workflow_definition(WorkflowDefinition {
                id: WorkflowDefinitionId::new(),
                slug: "on-order".to_string(),
                name: "on-order".to_string(),
                version: 1,
                steps,
                triggers: vec![],
                event_triggers: vec![],
                parameters_schema: json!({}),
                default_parameters: json!({"mode": "default"}),
                metadata: json!({}),
                dag,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let processor = EventTriggerProcessor::new(store.clone(), launcher.clone());
        Fixture {
            _dir: dir,
            store,
            launcher,
            processor,
            workflow,
        }
    }

    async fn seed_trigger(
        fixture: &Fixture,
        mutate: impl FnOnce(&mut WorkflowEventTrigger),
    ) -> WorkflowEventTrigger {
        let mut trigger = WorkflowEventTrigger {
            id: TriggerId::new(),
            workflow_definition_id: fixture.workflow.id,
            name: "on order created".to_string(),
            event_type: "order.created".to_string(),
            event_source: None,
            predicates: vec![],
            parameter_template: None,
            throttle_window_ms: None,
            throttle_count: None,
            max_concurrency: None,
            idempotency_key_expression: None,
            status: TriggerStatus::Active,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        mutate(&mut trigger);
        fixture.store.put_trigger(trigger).await.unwrap()
    }

    fn envelope(payload: Value) -> EventEnvelope {
        EventEnvelope::new("order.created", payload).with_source("commerce")
    }

    #[test]
    fn predicate_operators_cover_the_grammar() {
        let scope = TemplateScope::new(json!({
            "payload": {"region": "us-east", "total": 125.5, "tags": null}
        }));

        let check = |value: Value| {
            let predicate: TriggerPredicate = serde_json::from_value(value).unwrap();
            predicate_holds(&predicate, &scope)
        };

        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "equals", "value": "us-east"})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "notEquals", "value": "eu-west"})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "in", "values": ["us-east", "us-west"]})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "notIn", "values": ["eu-west"]})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "exists"})));
        assert!(!check(json!({"type": "jsonPath", "path": "$.payload.tags", "operator": "exists"})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.total", "operator": "greaterThan", "value": 100.0})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.total", "operator": "lessThan", "value": 200.0})));
        assert!(check(json!({"type": "jsonPath", "path": "$.payload.region", "operator": "matches", "pattern": "^us-"})));
        assert!(!check(json!({"type": "jsonPath", "path": "$.payload.missing", "operator": "equals", "value": 1})));
    }

    #[tokio::test]
    async fn matching_envelope_launches_a_run_with_templated_parameters() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.predicates = vec![serde_json::from_value(json!({
                "type": "jsonPath",
                "path": "$.payload.region",
                "operator": "equals",
                "value": "us-east"
            }))
            .unwrap()];
            t.parameter_template = Some(json!({
                "orderId": "{{ payload.orderId }}",
                "region": "{{ payload.region }}"
            }));
        })
        .await;

        let deliveries = fixture
            .processor
            .process_envelope(&envelope(json!({"orderId": "o-1", "region": "us-east"})))
            .await
            .unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Launched);
        let run_id = deliveries[0].workflow_run_id.unwrap();
        assert_eq!(fixture.launcher.ids(), vec![run_id]);

        let run = fixture.store.get_workflow_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.triggered_by, "event-trigger");
        assert_eq!(run.parameters["orderId"], "o-1");
        assert!(matches!(run.trigger, RunTrigger::Event { .. }));
    }

    #[tokio::test]
    async fn non_matching_predicates_leave_no_delivery() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.predicates = vec![serde_json::from_value(json!({
                "type": "jsonPath",
                "path": "$.payload.region",
                "operator": "equals",
                "value": "eu-west"
            }))
            .unwrap()];
        })
        .await;

        let deliveries = fixture
            .processor
            .process_envelope(&envelope(json!({"region": "us-east"})))
            .await
            .unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn event_source_pins_are_enforced() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.event_source = Some("warehouse".to_string());
        })
        .await;

        let deliveries = fixture
            .processor
            .process_envelope(&envelope(json!({})))
            .await
            .unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn throttle_window_caps_launches() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.throttle_window_ms = Some(60_000);
            t.throttle_count = Some(2);
        })
        .await;

        let mut statuses = Vec::new();
        for i in 0..4 {
            let deliveries = fixture
                .processor
                .process_envelope(&envelope(json!({"n": i})))
                .await
                .unwrap();
            statuses.push(deliveries[0].status);
        }

        assert_eq!(
            statuses,
            vec![
                DeliveryStatus::Launched,
                DeliveryStatus::Launched,
                DeliveryStatus::Throttled,
                DeliveryStatus::Throttled,
            ]
        );
    }

    #[tokio::test]
    async fn max_concurrency_counts_live_runs() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.max_concurrency = Some(1);
        })
        .await;

        // First launch leaves a pending run in the store.
        let first = fixture
            .processor
            .process_envelope(&envelope(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(first[0].status, DeliveryStatus::Launched);

        let second = fixture
            .processor
            .process_envelope(&envelope(json!({"n": 2})))
            .await
            .unwrap();
        assert_eq!(second[0].status, DeliveryStatus::Throttled);

        // Completing the live run frees a slot.
        let mut run = fixture
            .store
            .get_workflow_run(first[0].workflow_run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        run.status = WorkflowRunStatus::Succeeded;
        run.completed_at = Some(Utc::now());
        fixture.store.save_workflow_run(run).await.unwrap();

        let third = fixture
            .processor
            .process_envelope(&envelope(json!({"n": 3})))
            .await
            .unwrap();
        assert_eq!(third[0].status, DeliveryStatus::Launched);
    }

    #[tokio::test]
    async fn idempotency_key_suppresses_replays() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.idempotency_key_expression = Some("{{ payload.orderId }}".to_string());
        })
        .await;

        let first = fixture
            .processor
            .process_envelope(&envelope(json!({"orderId": "o-7"})))
            .await
            .unwrap();
        let second = fixture
            .processor
            .process_envelope(&envelope(json!({"orderId": "o-7"})))
            .await
            .unwrap();

        assert_eq!(first[0].status, DeliveryStatus::Launched);
        assert_eq!(second[0].status, DeliveryStatus::Skipped);
        // The replay points at the original run.
        assert_eq!(second[0].workflow_run_id, first[0].workflow_run_id);
        assert_eq!(fixture.launcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn disabled_triggers_are_ignored() {
        let fixture = fixture().await;
        seed_trigger(&fixture, |t| {
            t.status = TriggerStatus::Disabled;
        })
        .await;

        let deliveries = fixture
            .processor
            .process_envelope(&envelope(json!({})))
            .await
            .unwrap();
        assert!(deliveries.is_empty());
    }
}
