//! Partition key validation and derivation.
//!
//! Time-window partitions use half-open `[start, end)` windows. A key
//! is the window start formatted `%Y-%m-%dT%H:%M` in the asset's
//! declared timezone (UTC when unset).

use crate::error::{Error, Result};
use crate::types::{AssetPartitioning, Step, WindowGranularity, WorkflowDefinition};
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

pub const TIME_WINDOW_KEY_FORMAT: &str = "%Y-%m-%dT%H:%M";

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse()
            .map_err(|_| Error::validation(format!("unknown timezone '{name}'"))),
    }
}

/// Truncate an instant to the start of its window in the given zone.
fn truncate<ZonedTz: TimeZone>(
    at: DateTime<ZonedTz>,
    granularity: WindowGranularity,
) -> DateTime<ZonedTz> {
    let at = at
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing seconds is always representable");
    match granularity {
        WindowGranularity::Minute => at,
        WindowGranularity::Hour => at.with_minute(0).expect("zeroing minutes"),
        WindowGranularity::Day => at
            .with_minute(0)
            .and_then(|t| t.with_hour(0))
            .expect("zeroing time of day"),
        WindowGranularity::Week => {
            let midnight = at
                .with_minute(0)
                .and_then(|t| t.with_hour(0))
                .expect("zeroing time of day");
            let back_days = midnight.weekday().num_days_from_monday() as i64;
            midnight - Duration::days(back_days)
        }
        WindowGranularity::Month => at
            .with_minute(0)
            .and_then(|t| t.with_hour(0))
            .and_then(|t| t.with_day(1))
            .expect("first of month is always representable"),
    }
}

/// Partition key for a schedule occurrence against a time-window asset.
pub fn key_for_occurrence(
    occurrence: DateTime<Utc>,
    granularity: WindowGranularity,
    timezone: Option<&str>,
) -> Result<String> {
    let tz = parse_timezone(timezone)?;
    let local = truncate(occurrence.with_timezone(&tz), granularity);
    Ok(local.format(TIME_WINDOW_KEY_FORMAT).to_string())
}

/// Validate a run's partition key against one partitioning declaration.
pub fn validate_key(partitioning: &AssetPartitioning, key: Option<&str>) -> Result<()> {
    match partitioning {
        AssetPartitioning::Static { keys } => {
            let key = key.ok_or_else(|| {
                Error::validation("a partition key is required for a statically partitioned asset")
            })?;
            if !keys.iter().any(|k| k == key) {
                return Err(Error::validation(format!(
                    "partition key '{key}' is not one of the declared static keys"
                )));
            }
            Ok(())
        }
        AssetPartitioning::TimeWindow {
            granularity,
            timezone,
        } => {
            let key = key.ok_or_else(|| {
                Error::validation(
                    "a partition key is required for a time-window partitioned asset",
                )
            })?;
            let tz = parse_timezone(timezone.as_deref())?;
            let naive = NaiveDateTime::parse_from_str(key, TIME_WINDOW_KEY_FORMAT)
                .map_err(|_| {
                    Error::validation(format!(
                        "partition key '{key}' is not a {TIME_WINDOW_KEY_FORMAT} timestamp"
                    ))
                })?;
            let local = tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
                Error::validation(format!(
                    "partition key '{key}' does not exist in timezone {tz}"
                ))
            })?;
            let aligned = truncate(local.clone(), *granularity);
            if aligned != local {
                return Err(Error::validation(format!(
                    "partition key '{key}' is not aligned to the {granularity:?} window start"
                )));
            }
            Ok(())
        }
        AssetPartitioning::Dynamic => Ok(()),
    }
}

/// The first produced asset declaration that constrains the run's
/// partition key (static or time-window).
pub fn required_partitioning(definition: &WorkflowDefinition) -> Option<&AssetPartitioning> {
    definition.steps.iter().find_map(step_partitioning)
}

fn step_partitioning(step: &Step) -> Option<&AssetPartitioning> {
    step.produces().iter().find_map(|asset| {
        asset.partitioning.as_ref().filter(|p| {
            matches!(
                p,
                AssetPartitioning::Static { .. } | AssetPartitioning::TimeWindow { .. }
            )
        })
    })
}

/// Validate a run's partition key against every partition-constrained
/// asset the workflow produces. Runs of unpartitioned workflows may
/// carry any key.
pub fn validate_run_key(definition: &WorkflowDefinition, key: Option<&str>) -> Result<()> {
    for step in &definition.steps {
        if let Some(partitioning) = step_partitioning(step) {
            validate_key(partitioning, key)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn time_window(granularity: WindowGranularity, timezone: Option<&str>) -> AssetPartitioning {
        AssetPartitioning::TimeWindow {
            granularity,
            timezone: timezone.map(|s| s.to_string()),
        }
    }

    #[test]
    fn static_keys_must_be_declared() {
        let partitioning = AssetPartitioning::Static {
            keys: vec!["eu".to_string(), "us".to_string()],
        };

        assert!(validate_key(&partitioning, Some("eu")).is_ok());
        assert!(validate_key(&partitioning, Some("apac")).is_err());
        assert!(validate_key(&partitioning, None).is_err());
    }

    #[test]
    fn minute_window_accepts_exact_keys() {
        let partitioning = time_window(WindowGranularity::Minute, None);
        assert!(validate_key(&partitioning, Some("2025-10-21T14:40")).is_ok());
        assert!(validate_key(&partitioning, Some("2025-10-21")).is_err());
    }

    #[test]
    fn hour_and_day_windows_require_alignment() {
        let hourly = time_window(WindowGranularity::Hour, None);
        assert!(validate_key(&hourly, Some("2025-10-21T14:00")).is_ok());
        assert!(validate_key(&hourly, Some("2025-10-21T14:40")).is_err());

        let daily = time_window(WindowGranularity::Day, None);
        assert!(validate_key(&daily, Some("2025-10-21T00:00")).is_ok());
        assert!(validate_key(&daily, Some("2025-10-21T14:00")).is_err());
    }

    #[test]
    fn weekly_windows_start_on_monday() {
        let weekly = time_window(WindowGranularity::Week, None);
        // 2025-10-20 is a Monday.
        assert!(validate_key(&weekly, Some("2025-10-20T00:00")).is_ok());
        assert!(validate_key(&weekly, Some("2025-10-21T00:00")).is_err());
    }

    #[test]
    fn occurrence_keys_are_zone_local() {
        let occurrence = Utc.with_ymd_and_hms(2025, 10, 21, 14, 40, 17).unwrap();

        let key = key_for_occurrence(occurrence, WindowGranularity::Minute, None).unwrap();
        assert_eq!(key, "2025-10-21T14:40");

        let key =
            key_for_occurrence(occurrence, WindowGranularity::Hour, Some("Europe/Berlin")).unwrap();
        // 14:40 UTC is 16:40 in Berlin (CEST).
        assert_eq!(key, "2025-10-21T16:00");
    }

    #[test]
    fn run_key_validation_covers_all_produced_assets() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {
                "type": "job",
                "id": "emit",
                "jobSlug": "emit",
                "produces": [{
                    "assetId": "orders.hourly",
                    "partitioning": {"type": "timeWindow", "granularity": "hour"}
                }]
            }
        ]))
        .unwrap();
        let definition = WorkflowDefinition {
            id: crate::types::WorkflowDefinitionId::new(),
            slug: "wf".to_string(),
            name: "wf".to_string(),
            version: 1,
            steps,
            triggers: vec![],
            event_triggers: vec![],
            parameters_schema: json!({}),
            default_parameters: json!({}),
            metadata: json!({}),
            dag: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(validate_run_key(&definition, Some("2025-10-21T14:00")).is_ok());
        assert!(validate_run_key(&definition, None).is_err());
        assert!(required_partitioning(&definition).is_some());
    }
}
