//! Cron materialization of workflow schedules.
//!
//! A long-lived supervisor ticks every `interval`; each due schedule is
//! advanced under a per-schedule advisory lock, materializing at most
//! one window (catch-up disabled) or up to `max_windows` (catch-up
//! enabled) per tick, and enqueueing one run per occurrence.

use crate::error::{Error, Result};
use crate::launch::RunLauncher;
use crate::storage::records::RecordStore;
use crate::types::*;
use crate::workflow::partition;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Hard bound on occurrence iteration within one schedule advance, so
/// a stale schedule with a dense cron cannot spin a tick forever.
const MAX_OCCURRENCE_SCAN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
    pub batch_size: usize,
    pub max_windows: usize,
    /// `WEFT_SCHEDULER_ADVISORY_LOCKS`; disabled assumes single-writer.
    pub use_advisory_locks: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 20,
            max_windows: 10,
            use_advisory_locks: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub ticks: AtomicU64,
    pub runs_created: AtomicU64,
    pub schedules_skipped: AtomicU64,
    pub enqueue_failures: AtomicU64,
}

/// Outcome of one tick, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub runs_created: usize,
    pub skipped_locked: usize,
    pub failures: usize,
}

pub struct WorkflowScheduler {
    store: Arc<dyn RecordStore>,
    launcher: Arc<dyn RunLauncher>,
    options: SchedulerOptions,
    metrics: SchedulerMetrics,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        launcher: Arc<dyn RunLauncher>,
        options: SchedulerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            launcher,
            options,
            metrics: SchedulerMetrics::default(),
            shutdown,
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Spawn the tick loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.options.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now();
                        match scheduler.tick(now).await {
                            Ok(summary) if summary.due > 0 => {
                                tracing::info!(
                                    due = summary.due,
                                    runs = summary.runs_created,
                                    skipped = summary.skipped_locked,
                                    failures = summary.failures,
                                    "scheduler tick"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the loop, draining any in-flight tick before returning.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One pass over the due schedules. Public so tests and callers
    /// can drive time deterministically.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let due = self
            .store
            .list_due_schedules(now, self.options.batch_size)
            .await?;

        let mut summary = TickSummary {
            due: due.len(),
            ..Default::default()
        };

        for candidate in due {
            let _guard = if self.options.use_advisory_locks {
                match self
                    .store
                    .try_advisory_lock(&format!("workflow-schedule:{}", candidate.id))
                {
                    Some(guard) => Some(guard),
                    None => {
                        summary.skipped_locked += 1;
                        self.metrics.schedules_skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            } else {
                None
            };

            match self.advance_schedule(candidate.id, now).await {
                Ok(created) => summary.runs_created += created,
                Err(e) => {
                    summary.failures += 1;
                    self.metrics.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(schedule = %candidate.id, error = %e, "schedule advance failed");
                }
            }
        }

        self.metrics
            .runs_created
            .fetch_add(summary.runs_created as u64, Ordering::Relaxed);
        Ok(summary)
    }

    /// Advance one schedule under its lock. Re-reads the record so a
    /// concurrent worker that already advanced it is a no-op here.
    async fn advance_schedule(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<usize> {
        let Some(mut schedule) = self.store.get_schedule(id).await? else {
            return Ok(0);
        };
        if !schedule.is_active {
            return Ok(0);
        }
        let Some(next_run_at) = schedule.next_run_at else {
            return Ok(0);
        };
        if next_run_at > now {
            // Another worker got here first.
            self.store.put_schedule(schedule).await?;
            return Ok(0);
        }

        let Some(definition) = self
            .store
            .get_workflow_definition(schedule.workflow_definition_id)
            .await?
        else {
            tracing::warn!(schedule = %id, "workflow definition gone; deactivating schedule");
            schedule.is_active = false;
            self.store.put_schedule(schedule).await?;
            return Ok(0);
        };

        let cron = parse_cron(&schedule.cron)?;
        let tz = parse_timezone(schedule.timezone.as_deref())?;

        // Static/dynamic-partitioned outputs cannot derive a key from
        // an occurrence; metadata still advances to avoid a tight loop.
        let partitioning = partition::required_partitioning(&definition);
        let skip_runs = matches!(partitioning, Some(AssetPartitioning::Static { .. }));

        let occurrences = if schedule.catch_up {
            let cursor = schedule.catchup_cursor.unwrap_or(next_run_at);
            occurrences_between(&cron, tz, cursor, now, self.options.max_windows)
        } else {
            // Only the most recent occurrence <= now.
            let mut all = occurrences_between(&cron, tz, next_run_at, now, MAX_OCCURRENCE_SCAN);
            all.drain(..all.len().saturating_sub(1));
            all
        };

        let mut created = 0usize;
        for occurrence in &occurrences {
            let window_end = next_occurrence(&cron, tz, *occurrence)
                .unwrap_or(*occurrence + ChronoDuration::seconds(1));
            let window = ScheduleWindow {
                start: *occurrence,
                end: window_end,
            };

            if !skip_runs {
                match self
                    .materialize_run(&schedule, &definition, *occurrence, window, partitioning)
                    .await
                {
                    Ok(()) => created += 1,
                    Err(e) => {
                        // Leave the cursor on the failed occurrence so
                        // the next tick retries it.
                        schedule.catchup_cursor = Some(*occurrence);
                        schedule.next_run_at = Some(*occurrence);
                        self.store.put_schedule(schedule).await?;
                        return Err(e);
                    }
                }
            }

            schedule.last_materialized_window = Some(window);
            schedule.catchup_cursor = Some(window_end);
            schedule.next_run_at = Some(window_end);
        }

        if occurrences.is_empty() {
            // Nothing <= now despite being listed due; push forward.
            let successor = next_occurrence(&cron, tz, now)
                .unwrap_or(now + ChronoDuration::seconds(60));
            schedule.next_run_at = Some(successor);
        } else if !schedule.catch_up {
            let successor = next_occurrence(&cron, tz, now)
                .unwrap_or(now + ChronoDuration::seconds(60));
            schedule.next_run_at = Some(successor);
            schedule.catchup_cursor = None;
        }

        self.store.put_schedule(schedule).await?;
        Ok(created)
    }

    async fn materialize_run(
        &self,
        schedule: &Schedule,
        definition: &WorkflowDefinition,
        occurrence: DateTime<Utc>,
        window: ScheduleWindow,
        partitioning: Option<&AssetPartitioning>,
    ) -> Result<()> {
        let partition_key = match partitioning {
            Some(AssetPartitioning::TimeWindow {
                granularity,
                timezone,
            }) => Some(partition::key_for_occurrence(
                occurrence,
                *granularity,
                timezone.as_deref().or(schedule.timezone.as_deref()),
            )?),
            _ => None,
        };

        let parameters = schedule
            .parameters
            .clone()
            .unwrap_or_else(|| definition.default_parameters.clone());

        let trigger = RunTrigger::Schedule {
            schedule: ScheduleTriggerInfo {
                id: schedule.id,
                name: schedule.name.clone(),
                cron: schedule.cron.clone(),
                timezone: schedule.timezone.clone(),
                occurrence,
                window,
                catch_up: schedule.catch_up,
            },
        };

        let run = WorkflowRun {
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
            trigger,
            triggered_by: "scheduler".to_string(),
            partition_key,
            retry_summary: Default::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let run = self.store.create_workflow_run(run).await?;
        self.launcher.enqueue(run.id).await?;
        tracing::debug!(
            schedule = %schedule.id,
            run = %run.id,
            occurrence = %occurrence,
            "materialized scheduled run"
        );
        Ok(())
    }
}

/// Parse a 5-field (minute-resolution) or 6-field (second-resolution)
/// cron expression.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expression}"),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(Error::validation(format!(
                "cron expression '{expression}' must have 5 or 6 fields"
            )))
        }
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("invalid cron expression '{expression}': {e}")))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| Error::validation(format!("unknown timezone '{name}'"))),
    }
}

/// Occurrences in `[from, until]`, ascending, capped at `limit`.
fn occurrences_between(
    cron: &cron::Schedule,
    tz: Tz,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let anchor = (from - ChronoDuration::seconds(1)).with_timezone(&tz);
    cron.after(&anchor)
        .take(limit.min(MAX_OCCURRENCE_SCAN))
        .map(|local| local.with_timezone(&Utc))
        .take_while(|occurrence| *occurrence <= until)
        .collect()
}

fn next_occurrence(
    cron: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    cron.after(&after.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::RecordingRunLauncher;
    use crate::storage::RedbRecordStore;
    use crate::workflow::dag::build_dag;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seed_workflow(store: &RedbRecordStore, slug: &str) -> WorkflowDefinition {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "job", "id": "only", "jobSlug": "noop"}
        ]))
        .unwrap();
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
                default_parameters: json!({"source": "defaults"}),
                metadata: json!({}),
                dag,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    async fn seed_schedule(
        store: &RedbRecordStore,
        workflow: &WorkflowDefinition,
        cron: &str,
        catch_up: bool,
        next_run_at: DateTime<Utc>,
    ) -> Schedule {
        store
            .put_schedule(Schedule {
                id: ScheduleId::new(),
                workflow_definition_id: workflow.id,
                name: Some("nightly".to_string()),
                cron: cron.to_string(),
                timezone: None,
                parameters: None,
                start_window: None,
                end_window: None,
                catch_up,
                next_run_at: Some(next_run_at),
                last_materialized_window: None,
                catchup_cursor: None,
                is_active: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn scheduler(
        store: Arc<RedbRecordStore>,
        launcher: Arc<RecordingRunLauncher>,
        max_windows: usize,
    ) -> WorkflowScheduler {
        WorkflowScheduler::new(
            store,
            launcher,
            SchedulerOptions {
                max_windows,
                ..Default::default()
            },
        )
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("*/30 * * * * *").is_ok());
        assert!(parse_cron("* *").is_err());
    }

    #[tokio::test]
    async fn catch_up_materializes_bounded_ascending_windows() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());
        let workflow = seed_workflow(&store, "wf").await;

        let now = Utc::now();
        let schedule =
            seed_schedule(&store, &workflow, "*/30 * * * * *", true, now - ChronoDuration::seconds(150))
                .await;

        let scheduler = scheduler(store.clone(), launcher.clone(), 3);
        let summary = scheduler.tick(now).await.unwrap();

        assert_eq!(summary.runs_created, 3);
        assert_eq!(launcher.ids().len(), 3);

        let runs = store.list_workflow_runs(workflow.id).await.unwrap();
        assert_eq!(runs.len(), 3);
        let mut occurrences: Vec<DateTime<Utc>> = runs
            .iter()
            .map(|r| match &r.trigger {
                RunTrigger::Schedule { schedule } => schedule.occurrence,
                other => panic!("expected schedule trigger, got {other:?}"),
            })
            .collect();
        occurrences.sort();
        assert_eq!(occurrences[1] - occurrences[0], ChronoDuration::seconds(30));
        assert_eq!(occurrences[2] - occurrences[1], ChronoDuration::seconds(30));
        for run in &runs {
            assert_eq!(run.triggered_by, "scheduler");
            assert_eq!(run.parameters["source"], "defaults");
        }

        let advanced = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(advanced.catchup_cursor, advanced.next_run_at);
        assert_eq!(
            advanced.catchup_cursor.unwrap(),
            occurrences[2] + ChronoDuration::seconds(30)
        );
    }

    #[tokio::test]
    async fn without_catch_up_only_the_most_recent_window_runs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());
        let workflow = seed_workflow(&store, "wf").await;

        let now = Utc::now();
        let schedule =
            seed_schedule(&store, &workflow, "*/30 * * * * *", false, now - ChronoDuration::seconds(150))
                .await;

        let scheduler = scheduler(store.clone(), launcher.clone(), 10);
        let summary = scheduler.tick(now).await.unwrap();

        assert_eq!(summary.runs_created, 1);
        let advanced = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert!(advanced.next_run_at.unwrap() > now);
        assert_eq!(advanced.catchup_cursor, None);
    }

    #[tokio::test]
    async fn advisory_lock_keeps_concurrent_schedulers_to_one_run() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());
        let workflow = seed_workflow(&store, "wf").await;

        let now = Utc::now();
        seed_schedule(&store, &workflow, "*/30 * * * * *", false, now - ChronoDuration::seconds(10))
            .await;

        let first = Arc::new(scheduler(store.clone(), launcher.clone(), 10));
        let second = Arc::new(scheduler(store.clone(), launcher.clone(), 10));

        let (a, b) = tokio::join!(
            {
                let s = first.clone();
                async move { s.tick(now).await.unwrap() }
            },
            {
                let s = second.clone();
                async move { s.tick(now).await.unwrap() }
            }
        );

        assert_eq!(a.runs_created + b.runs_created, 1);
        assert_eq!(store.list_workflow_runs(workflow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn future_schedules_are_untouched() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());
        let workflow = seed_workflow(&store, "wf").await;

        let now = Utc::now();
        seed_schedule(&store, &workflow, "0 0 * * *", false, now + ChronoDuration::hours(1)).await;

        let scheduler = scheduler(store.clone(), launcher.clone(), 10);
        let summary = scheduler.tick(now).await.unwrap();
        assert_eq!(summary.due, 0);
        assert_eq!(summary.runs_created, 0);
    }

    #[tokio::test]
    async fn start_stop_drains_the_loop() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbRecordStore::new(dir.path().join("records.redb")).unwrap());
        let launcher = Arc::new(RecordingRunLauncher::new());

        let scheduler = Arc::new(WorkflowScheduler::new(
            store,
            launcher,
            SchedulerOptions {
                interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;

        assert!(scheduler.metrics().ticks.load(Ordering::Relaxed) >= 1);
    }
}
