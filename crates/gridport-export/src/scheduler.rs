//! Cron-driven scheduled bulk exports
//!
//! Independently of the live pub/sub stream, persisted schedule records
//! describe periodic bulk pulls: on each poll tick, every enabled schedule
//! is checked for due-ness against its cron expression (evaluated in the
//! schedule's own timezone), and a due schedule pulls the target's mapped
//! points over the lookback window and dispatches them directly through
//! the target's handler — the per-value export-mode engine is bypassed,
//! this path is a bulk pull, not a live stream.
//!
//! Cron expressions are accepted in POSIX 5-field form and normalized by
//! prepending a seconds field; 6/7-field expressions pass through.

use crate::config::SchedulerSettings;
use crate::coordinator::ExportCoordinator;
use crate::store::{ConfigStore, ScheduleRecord, ScheduleRunOutcome};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Scheduled bulk exporter
pub struct ScheduledExporter {
    store: Arc<dyn ConfigStore>,
    coordinator: Arc<ExportCoordinator>,
    settings: SchedulerSettings,
}

impl ScheduledExporter {
    /// Create an exporter bound to one coordinator
    pub fn new(
        store: Arc<dyn ConfigStore>,
        coordinator: Arc<ExportCoordinator>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            coordinator,
            settings,
        }
    }

    /// Poll loop; returns when shutdown is signalled
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let poll = Duration::from_secs(self.settings.poll_interval_secs);
        info!("Scheduled exporter started, polling every {:?}", poll);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Scheduled exporter shutting down");
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }
            self.tick(Utc::now()).await;
        }
    }

    /// Evaluate every schedule once. Public so operators and tests can
    /// trigger a pass without waiting for the poll interval.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let schedules = match self.store.load_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                warn!("Could not load schedules: {}", e);
                return;
            }
        };

        for schedule in schedules.into_iter().filter(|s| s.enabled) {
            match is_due(&schedule, now) {
                Ok(true) => self.run_schedule(&schedule, now).await,
                Ok(false) => {}
                Err(e) => {
                    // Malformed cron/timezone skips this record only
                    warn!("Schedule {} skipped: {}", schedule.id, e);
                }
            }
        }
    }

    /// Execute one due schedule and write back the run outcome
    async fn run_schedule(&self, schedule: &ScheduleRecord, now: DateTime<Utc>) {
        info!(
            "Running schedule {} for target {} ({} x {})",
            schedule.id, schedule.target_id, schedule.lookback_periods, schedule.data_range
        );

        let period = match schedule.data_range.as_str() {
            "day" => ChronoDuration::days(1),
            _ => ChronoDuration::hours(1),
        };
        let from = now - period * schedule.lookback_periods.max(1) as i32;

        let success = match self.pull_and_dispatch(schedule, from, now).await {
            Ok(dispatched) => {
                debug!(
                    "Schedule {} dispatched {} rows",
                    schedule.id, dispatched
                );
                true
            }
            Err(e) => {
                warn!("Schedule {} run failed: {}", schedule.id, e);
                false
            }
        };

        let next_run = match next_occurrence(&schedule.cron_expression, &schedule.timezone, now) {
            Ok(next) => next,
            Err(_) => None,
        };

        let outcome = ScheduleRunOutcome {
            success,
            last_run: now,
            next_run,
        };
        if let Err(e) = self.store.update_schedule_run(schedule.id, outcome).await {
            warn!("Schedule {} outcome writeback failed: {}", schedule.id, e);
        }
    }

    async fn pull_and_dispatch(
        &self,
        schedule: &ScheduleRecord,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, String> {
        let snapshot = self.coordinator.registry().snapshot().await;
        let target = snapshot
            .get_by_id(schedule.target_id)
            .ok_or_else(|| format!("target {} not loaded", schedule.target_id))?;

        let point_ids: Vec<String> = target.mappings.keys().cloned().collect();
        if point_ids.is_empty() {
            debug!(
                "Schedule {}: target '{}' has no mapped points",
                schedule.id, target.name
            );
            return Ok(0);
        }

        let rows = self
            .store
            .load_history(&point_ids, from, to)
            .await
            .map_err(|e| format!("history pull: {}", e))?;
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();

        let result = self
            .coordinator
            .dispatch_bulk(schedule.target_id, &rows)
            .await
            .ok_or_else(|| format!("target '{}' has no usable handler", target.name))?;

        if result.success {
            Ok(count)
        } else {
            Err(result
                .error_message
                .unwrap_or_else(|| "dispatch failed".to_string()))
        }
    }
}

/// Whether a schedule is due at `now`.
///
/// The due time is the stored `next_run` when present; otherwise the first
/// cron occurrence after `last_run`. A schedule that has never run and has
/// no stored `next_run` anchors at `now` and therefore fires on a later
/// tick, not immediately.
pub fn is_due(schedule: &ScheduleRecord, now: DateTime<Utc>) -> Result<bool, String> {
    let due_at = match schedule.next_run {
        Some(next) => Some(next),
        None => {
            let anchor = schedule.last_run.unwrap_or(now);
            next_occurrence(&schedule.cron_expression, &schedule.timezone, anchor)?
        }
    };
    Ok(matches!(due_at, Some(due) if now >= due))
}

/// First cron occurrence strictly after `after`, evaluated in the
/// schedule's timezone, returned in UTC
pub fn next_occurrence(
    cron_expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    let normalized = normalize_cron(cron_expression);
    let schedule = cron::Schedule::from_str(&normalized)
        .map_err(|e| format!("invalid cron '{}': {}", cron_expression, e))?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|e| format!("invalid timezone '{}': {}", timezone, e))?;

    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

/// Prepend a seconds field to POSIX 5-field expressions
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}
