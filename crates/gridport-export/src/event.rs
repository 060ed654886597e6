//! Event and dispatch-result types
//!
//! [`AlarmEvent`] is the unit of data flowing through the pipeline. Its serde
//! field names are the compact keys used on the pub/sub bus
//! (`{bd, nm, vl, tm, al, st, des}`), so deserializing a bus payload and
//! serializing one back are the same type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One value update or alarm from an upstream collector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmEvent {
    /// Building / device group identifier
    #[serde(rename = "bd")]
    pub building_id: i64,

    /// Point name within the building
    #[serde(rename = "nm")]
    pub point_name: String,

    /// Current value
    #[serde(rename = "vl")]
    pub value: f64,

    /// Source timestamp
    #[serde(rename = "tm")]
    pub timestamp: DateTime<Utc>,

    /// Alarm flag (0 = normal, >0 = alarm class)
    #[serde(rename = "al", default)]
    pub alarm_flag: i32,

    /// Point status / quality code
    #[serde(rename = "st", default)]
    pub status: i32,

    /// Human-readable description
    #[serde(rename = "des", default)]
    pub description: String,
}

impl AlarmEvent {
    /// Create an event with the given coordinates, timestamped now
    pub fn new(building_id: i64, point_name: impl Into<String>, value: f64) -> Self {
        Self {
            building_id,
            point_name: point_name.into(),
            value,
            timestamp: Utc::now(),
            alarm_flag: 0,
            status: 0,
            description: String::new(),
        }
    }

    /// Mark as an alarm-class event (builder-style)
    pub fn with_alarm(mut self, flag: i32) -> Self {
        self.alarm_flag = flag;
        self
    }

    /// Set the status code (builder-style)
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    /// Set the description (builder-style)
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the timestamp (builder-style)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mapping key for this event's point, `"<building_id>:<point_name>"`
    pub fn point_key(&self) -> String {
        format!("{}:{}", self.building_id, self.point_name)
    }

    /// True for alarm-class events
    pub fn is_alarm(&self) -> bool {
        self.alarm_flag > 0
    }
}

/// Outcome of one (event, target) dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    /// Whether the dispatch reached the downstream system
    pub success: bool,
    /// Target identifier
    pub target_id: i64,
    /// Target name at dispatch time
    pub target_name: String,
    /// Failure message, when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Transport status code (HTTP status, MQTT reason, ...) when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Wall time spent in the handler, milliseconds
    pub processing_time_ms: u64,
    /// Serialized payload size in bytes
    pub data_size: usize,
}

impl ExportResult {
    /// Successful dispatch
    pub fn ok(target_id: i64, target_name: impl Into<String>) -> Self {
        Self {
            success: true,
            target_id,
            target_name: target_name.into(),
            error_message: None,
            status_code: None,
            processing_time_ms: 0,
            data_size: 0,
        }
    }

    /// Failed dispatch
    pub fn failure(
        target_id: i64,
        target_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            target_id,
            target_name: target_name.into(),
            error_message: Some(message.into()),
            status_code: None,
            processing_time_ms: 0,
            data_size: 0,
        }
    }

    /// Attach a transport status code (builder-style)
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Record handler wall time (builder-style)
    pub fn with_processing_time(mut self, elapsed: std::time::Duration) -> Self {
        self.processing_time_ms = elapsed.as_millis() as u64;
        self
    }

    /// Record serialized payload size (builder-style)
    pub fn with_data_size(mut self, bytes: usize) -> Self {
        self.data_size = bytes;
        self
    }
}

/// Durable record of one dispatch attempt, queued for async persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportLogEntry {
    /// Target identifier
    pub target_id: i64,
    /// Target name at dispatch time
    pub target_name: String,
    /// Mapping key of the source point (`"bd:nm"`), empty for bulk exports
    pub point_key: String,
    /// Raw source value
    pub source_value: f64,
    /// Value after scale/offset conversion
    pub converted_value: f64,
    /// Whether the dispatch succeeded
    pub success: bool,
    /// Failure message, if any
    pub error_message: Option<String>,
    /// Transport status code, if any
    pub status_code: Option<u16>,
    /// Snapshot of the rendered payload (truncated by the store if needed)
    pub payload_snapshot: String,
    /// Handler wall time, milliseconds
    pub processing_time_ms: u64,
    /// Serialized payload size in bytes
    pub data_size: usize,
    /// Exporting client identifier
    pub client_id: String,
    /// When the dispatch attempt completed
    pub logged_at: DateTime<Utc>,
}

impl ExportLogEntry {
    /// Build a log entry from a dispatch result and value snapshots
    pub fn from_result(
        result: &ExportResult,
        point_key: impl Into<String>,
        source_value: f64,
        converted_value: f64,
        payload_snapshot: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            target_id: result.target_id,
            target_name: result.target_name.clone(),
            point_key: point_key.into(),
            source_value,
            converted_value,
            success: result.success,
            error_message: result.error_message.clone(),
            status_code: result.status_code,
            payload_snapshot: payload_snapshot.into(),
            processing_time_ms: result.processing_time_ms,
            data_size: result.data_size,
            client_id: client_id.into(),
            logged_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_round_trip() {
        let json = r#"{"bd":1001,"nm":"chiller_supply_temp","vl":6.5,"tm":"2025-03-01T08:30:00Z","al":1,"st":0,"des":"supply temp high"}"#;
        let event: AlarmEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.building_id, 1001);
        assert_eq!(event.point_name, "chiller_supply_temp");
        assert_eq!(event.value, 6.5);
        assert_eq!(event.alarm_flag, 1);
        assert!(event.is_alarm());
        assert_eq!(event.point_key(), "1001:chiller_supply_temp");

        let out = serde_json::to_value(&event).unwrap();
        assert_eq!(out["bd"], 1001);
        assert_eq!(out["nm"], "chiller_supply_temp");
        assert_eq!(out["al"], 1);
    }

    #[test]
    fn test_optional_wire_fields_default() {
        let json = r#"{"bd":2,"nm":"kwh_total","vl":1234.0,"tm":"2025-03-01T00:00:00Z"}"#;
        let event: AlarmEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.alarm_flag, 0);
        assert_eq!(event.status, 0);
        assert!(event.description.is_empty());
        assert!(!event.is_alarm());
    }

    #[test]
    fn test_export_result_builders() {
        let result = ExportResult::ok(3, "cloud-a")
            .with_status_code(200)
            .with_processing_time(std::time::Duration::from_millis(42))
            .with_data_size(512);
        assert!(result.success);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.processing_time_ms, 42);
        assert_eq!(result.data_size, 512);

        let failed = ExportResult::failure(3, "cloud-a", "connection refused");
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_log_entry_from_result() {
        let result = ExportResult::ok(9, "lake").with_data_size(64);
        let entry = ExportLogEntry::from_result(&result, "7:temp", 21.5, 294.65, "{}", "gw-01");
        assert_eq!(entry.target_id, 9);
        assert_eq!(entry.point_key, "7:temp");
        assert_eq!(entry.source_value, 21.5);
        assert_eq!(entry.converted_value, 294.65);
        assert!(entry.success);
    }
}
