//! Configuration store seam
//!
//! The relational engine behind target/mapping/template/schedule records is
//! an external collaborator; the export engine consumes it exclusively
//! through the [`ConfigStore`] trait. [`MemoryStore`] is the shipped
//! implementation, used by tests, demos, and embedded deployments.

use crate::error::{ExportError, Result};
use crate::event::ExportLogEntry;
use crate::mode::ExportMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A configured downstream target as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: i64,
    pub name: String,
    /// Handler type string, resolved through the handler registry
    /// ("http", "object-storage", "file", "mqtt", ...)
    pub target_type: String,
    pub enabled: bool,
    /// Opaque transport config blob; may arrive wrapped in a
    /// single-element JSON array
    pub config: serde_json::Value,
    pub export_mode: ExportMode,
    /// Dispatch priority, ascending dispatched first; `None` sorts last
    #[serde(default)]
    pub priority: Option<i32>,
    /// Named payload template; `None` uses the standard template
    #[serde(default)]
    pub template: Option<String>,
}

/// Point-to-field mapping for one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointMappingRecord {
    pub target_id: i64,
    /// Mapping key, `"<building_id>:<point_name>"`
    pub point_id: String,
    pub target_field: String,
    /// Per-point site override
    #[serde(default)]
    pub site_id: Option<String>,
    /// Nested conversion config blob, `{"scale": .., "offset": ..}`
    #[serde(default)]
    pub conversion: Option<serde_json::Value>,
}

/// Stored payload template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    pub system_type: String,
    pub template: serde_json::Value,
    pub active: bool,
}

/// Scheduled bulk-export record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: i64,
    pub target_id: i64,
    /// POSIX 5-field or 6/7-field cron expression
    pub cron_expression: String,
    /// IANA timezone name, e.g. "Asia/Shanghai"
    pub timezone: String,
    /// Aggregation window key: "hour" or "day"
    pub data_range: String,
    /// How many periods back each run pulls
    pub lookback_periods: u32,
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// Outcome of one schedule run, written back onto the record
#[derive(Debug, Clone)]
pub struct ScheduleRunOutcome {
    pub success: bool,
    pub last_run: DateTime<Utc>,
    pub next_run: Option<DateTime<Utc>>,
}

/// One historical value row pulled for a scheduled bulk export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    /// Mapping key, `"<building_id>:<point_name>"`
    pub point_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read/write access to export configuration and the export log
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All target records, enabled and disabled
    async fn load_targets(&self) -> Result<Vec<TargetRecord>>;

    /// Per-gateway target assignment. An empty list means "all targets".
    async fn load_target_allowlist(&self) -> Result<Vec<String>>;

    /// Point mappings for one target
    async fn load_mappings(&self, target_id: i64) -> Result<Vec<PointMappingRecord>>;

    /// Active payload templates
    async fn load_templates(&self) -> Result<Vec<TemplateRecord>>;

    /// All schedule records
    async fn load_schedules(&self) -> Result<Vec<ScheduleRecord>>;

    /// Write back one schedule run outcome (counters + timestamps)
    async fn update_schedule_run(&self, schedule_id: i64, outcome: ScheduleRunOutcome)
        -> Result<()>;

    /// Persist a batch of export log entries
    async fn save_export_logs(&self, entries: Vec<ExportLogEntry>) -> Result<()>;

    /// Historical values for a set of points over `[from, to)`
    async fn load_history(
        &self,
        point_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryRow>>;
}

/// In-memory [`ConfigStore`] backed by `RwLock` tables
#[derive(Default)]
pub struct MemoryStore {
    targets: RwLock<Vec<TargetRecord>>,
    allowlist: RwLock<Vec<String>>,
    mappings: RwLock<HashMap<i64, Vec<PointMappingRecord>>>,
    templates: RwLock<Vec<TemplateRecord>>,
    schedules: RwLock<Vec<ScheduleRecord>>,
    history: RwLock<Vec<HistoryRow>>,
    export_logs: RwLock<Vec<ExportLogEntry>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the target table
    pub async fn set_targets(&self, targets: Vec<TargetRecord>) {
        *self.targets.write().await = targets;
    }

    /// Replace the gateway allow-list
    pub async fn set_allowlist(&self, names: Vec<String>) {
        *self.allowlist.write().await = names;
    }

    /// Add mappings for a target
    pub async fn add_mappings(&self, target_id: i64, rows: Vec<PointMappingRecord>) {
        self.mappings
            .write()
            .await
            .entry(target_id)
            .or_default()
            .extend(rows);
    }

    /// Replace the template table
    pub async fn set_templates(&self, templates: Vec<TemplateRecord>) {
        *self.templates.write().await = templates;
    }

    /// Replace the schedule table
    pub async fn set_schedules(&self, schedules: Vec<ScheduleRecord>) {
        *self.schedules.write().await = schedules;
    }

    /// Seed historical rows for scheduled-export tests
    pub async fn add_history(&self, rows: Vec<HistoryRow>) {
        self.history.write().await.extend(rows);
    }

    /// Export log rows persisted so far
    pub async fn export_logs(&self) -> Vec<ExportLogEntry> {
        self.export_logs.read().await.clone()
    }

    /// Current schedule records (after run writebacks)
    pub async fn schedules(&self) -> Vec<ScheduleRecord> {
        self.schedules.read().await.clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_targets(&self) -> Result<Vec<TargetRecord>> {
        Ok(self.targets.read().await.clone())
    }

    async fn load_target_allowlist(&self) -> Result<Vec<String>> {
        Ok(self.allowlist.read().await.clone())
    }

    async fn load_mappings(&self, target_id: i64) -> Result<Vec<PointMappingRecord>> {
        Ok(self
            .mappings
            .read()
            .await
            .get(&target_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_templates(&self) -> Result<Vec<TemplateRecord>> {
        Ok(self
            .templates
            .read()
            .await
            .iter()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn load_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        Ok(self.schedules.read().await.clone())
    }

    async fn update_schedule_run(
        &self,
        schedule_id: i64,
        outcome: ScheduleRunOutcome,
    ) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let record = schedules
            .iter_mut()
            .find(|s| s.id == schedule_id)
            .ok_or_else(|| ExportError::store(format!("unknown schedule id {}", schedule_id)))?;

        record.run_count += 1;
        if !outcome.success {
            record.failure_count += 1;
        }
        record.last_run = Some(outcome.last_run);
        record.next_run = outcome.next_run;
        Ok(())
    }

    async fn save_export_logs(&self, entries: Vec<ExportLogEntry>) -> Result<()> {
        self.export_logs.write().await.extend(entries);
        Ok(())
    }

    async fn load_history(
        &self,
        point_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryRow>> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .filter(|row| {
                row.timestamp >= from
                    && row.timestamp < to
                    && point_ids.iter().any(|p| p == &row.point_id)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn target(id: i64, name: &str) -> TargetRecord {
        TargetRecord {
            id,
            name: name.to_string(),
            target_type: "http".to_string(),
            enabled: true,
            config: serde_json::json!({"url": "http://localhost/ingest"}),
            export_mode: ExportMode::default(),
            priority: None,
            template: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_targets_and_mappings() {
        let store = MemoryStore::new();
        store.set_targets(vec![target(1, "a"), target(2, "b")]).await;
        store
            .add_mappings(
                1,
                vec![PointMappingRecord {
                    target_id: 1,
                    point_id: "7:temp".to_string(),
                    target_field: "temperature".to_string(),
                    site_id: None,
                    conversion: None,
                }],
            )
            .await;

        assert_eq!(store.load_targets().await.unwrap().len(), 2);
        assert_eq!(store.load_mappings(1).await.unwrap().len(), 1);
        assert!(store.load_mappings(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_run_writeback() {
        let store = MemoryStore::new();
        store
            .set_schedules(vec![ScheduleRecord {
                id: 5,
                target_id: 1,
                cron_expression: "0 * * * *".to_string(),
                timezone: "UTC".to_string(),
                data_range: "hour".to_string(),
                lookback_periods: 1,
                enabled: true,
                run_count: 0,
                failure_count: 0,
                last_run: None,
                next_run: None,
            }])
            .await;

        let ran_at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        store
            .update_schedule_run(
                5,
                ScheduleRunOutcome {
                    success: false,
                    last_run: ran_at,
                    next_run: None,
                },
            )
            .await
            .unwrap();

        let schedules = store.schedules().await;
        assert_eq!(schedules[0].run_count, 1);
        assert_eq!(schedules[0].failure_count, 1);
        assert_eq!(schedules[0].last_run, Some(ran_at));

        assert!(store
            .update_schedule_run(
                99,
                ScheduleRunOutcome {
                    success: true,
                    last_run: ran_at,
                    next_run: None
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_history_window_filter() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        store
            .add_history(vec![
                HistoryRow {
                    point_id: "7:kwh".into(),
                    value: 1.0,
                    timestamp: t0,
                },
                HistoryRow {
                    point_id: "7:kwh".into(),
                    value: 2.0,
                    timestamp: t0 + chrono::Duration::hours(1),
                },
                HistoryRow {
                    point_id: "8:kwh".into(),
                    value: 9.0,
                    timestamp: t0,
                },
            ])
            .await;

        let rows = store
            .load_history(
                &["7:kwh".to_string()],
                t0,
                t0 + chrono::Duration::minutes(30),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 1.0);
    }
}
