//! Service configuration
//!
//! YAML-deserialized runtime configuration for the export engine. Values
//! support `${VAR}` / `${VAR:-default}` environment-variable expansion,
//! applied to the raw file text before parsing.

use crate::error::{ExportError, Result};
use crate::export_log::ExportLogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Client identifier recorded on export log rows
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Pub/sub bus connection
    #[serde(default)]
    pub bus: BusConfig,

    /// Only process events for buildings implied by loaded mappings
    #[serde(default)]
    pub selective_subscription: bool,

    /// Export log queue tuning
    #[serde(default)]
    pub export_log: ExportLogSettings,

    /// Scheduled exporter tuning
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Health endpoint
    #[serde(default)]
    pub health: HealthSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            bus: BusConfig::default(),
            selective_subscription: false,
            export_log: ExportLogSettings::default(),
            scheduler: SchedulerSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

fn default_client_id() -> String {
    "gridport-export".to_string()
}

/// Pub/sub bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Broker URL
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Channel patterns to subscribe
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    /// Reconnect backoff floor in milliseconds
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,

    /// Reconnect backoff cap in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            channels: default_channels(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_channels() -> Vec<String> {
    vec![
        "alarms:*".to_string(),
        "schedules:*".to_string(),
        "system:notify".to_string(),
    ]
}

fn default_reconnect_min_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

/// Export log queue settings (see [`ExportLogConfig`])
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportLogSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_drop_log_every")]
    pub drop_log_every: u64,
}

impl Default for ExportLogSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_log_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            drop_log_every: default_drop_log_every(),
        }
    }
}

impl ExportLogSettings {
    /// Convert to the service-facing config type
    pub fn to_export_log_config(&self) -> ExportLogConfig {
        ExportLogConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            drop_log_every: self.drop_log_every,
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_log_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_drop_log_every() -> u64 {
    1000
}

/// Scheduled exporter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the schedule table is polled for due records
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

/// Health endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_port")]
    pub port: u16,

    #[serde(default = "default_health_path")]
    pub path: String,

    /// Rolling window size for per-target success rate
    #[serde(default = "default_health_window")]
    pub window: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
            path: default_health_path(),
            window: default_health_window(),
        }
    }
}

fn default_health_port() -> u16 {
    8090
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_window() -> usize {
    32
}

fn default_true() -> bool {
    true
}

impl ServiceConfig {
    /// Load from a YAML file, expanding `${VAR}` references first
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExportError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse from YAML text, expanding `${VAR}` references first
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural sanity checks beyond serde
    pub fn validate(&self) -> Result<()> {
        if self.bus.channels.is_empty() {
            return Err(ExportError::config("bus.channels must not be empty"));
        }
        if self.bus.reconnect_min_ms == 0 || self.bus.reconnect_min_ms > self.bus.reconnect_max_ms {
            return Err(ExportError::config(
                "bus reconnect backoff must satisfy 0 < min <= max",
            ));
        }
        if self.export_log.queue_capacity == 0 || self.export_log.batch_size == 0 {
            return Err(ExportError::config(
                "export_log queue_capacity and batch_size must be positive",
            ));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ExportError::config(
                "scheduler.poll_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` in raw config text.
///
/// Unset variables without a default expand to the empty string, with a
/// warning, so a missing secret shows up in logs instead of as a literal
/// `${...}` in connection strings.
pub fn expand_env_vars(raw: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        warn!("Environment variable '{}' is unset, expanding to empty", name);
                        String::new()
                    }
                },
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = ServiceConfig::from_yaml("client_id: gw-7\n").unwrap();
        assert_eq!(config.client_id, "gw-7");
        assert_eq!(config.bus.url, "redis://127.0.0.1:6379");
        assert_eq!(config.bus.channels.len(), 3);
        assert_eq!(config.export_log.queue_capacity, 10_000);
        assert!(config.scheduler.enabled);
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_env_expansion_with_default() {
        std::env::remove_var("GRIDPORT_TEST_UNSET");
        let expanded = expand_env_vars("url: ${GRIDPORT_TEST_UNSET:-redis://fallback:6379}");
        assert_eq!(expanded, "url: redis://fallback:6379");
    }

    #[test]
    fn test_env_expansion_set_variable() {
        std::env::set_var("GRIDPORT_TEST_SET", "redis://real:6379");
        let expanded = expand_env_vars("url: ${GRIDPORT_TEST_SET}");
        assert_eq!(expanded, "url: redis://real:6379");
    }

    #[test]
    fn test_env_expansion_unset_without_default() {
        std::env::remove_var("GRIDPORT_TEST_UNSET2");
        let expanded = expand_env_vars("token: '${GRIDPORT_TEST_UNSET2}'");
        assert_eq!(expanded, "token: ''");
    }

    #[test]
    fn test_validation_rejects_empty_channels() {
        let err = ServiceConfig::from_yaml("bus:\n  channels: []\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let err = ServiceConfig::from_yaml("scheduler:\n  poll_interval_secs: 0\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_full_yaml_round_trip() {
        let yaml = r#"
client_id: gw-9
bus:
  url: redis://bus.internal:6379
  channels: ["alarms:critical"]
selective_subscription: true
export_log:
  queue_capacity: 500
  batch_size: 50
scheduler:
  enabled: false
health:
  enabled: true
  port: 9105
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert!(config.selective_subscription);
        assert_eq!(config.export_log.queue_capacity, 500);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.health.port, 9105);
        let log_config = config.export_log.to_export_log_config();
        assert_eq!(log_config.batch_size, 50);
    }
}
