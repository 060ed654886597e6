//! Target configuration registry
//!
//! Authoritative, hot-reloadable view of targets, point mappings,
//! conversions, and dispatch priority. A reload builds the entire new
//! [`TargetSnapshot`] off-lock — fetching, parsing, sorting, constructing
//! handlers — and publishes it with a single write-lock swap, so readers
//! never observe a half-updated registry and never block the writer.
//!
//! Loading is partial-success by design: one malformed target config or
//! mapping row is logged and skipped, never failing the load of everything
//! else.

use crate::error::Result;
use crate::handlers::{HandlerRegistry, TargetHandler};
use crate::mode::ExportMode;
use crate::store::{ConfigStore, PointMappingRecord, TargetRecord};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Resolved mapping for one (target, point) pair
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub target_field: String,
    pub site_id: Option<String>,
    pub scale: f64,
    pub offset: f64,
}

impl MappingEntry {
    /// Apply the scale/offset conversion to a source value
    pub fn convert(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }
}

/// One enabled target inside a snapshot
pub struct TargetEntry {
    pub id: i64,
    pub name: String,
    pub target_type: String,
    /// Normalized config blob (array-unwrapped, string-decoded)
    pub config: Value,
    pub export_mode: ExportMode,
    pub priority: Option<i32>,
    pub template: Option<String>,
    /// Target-level default site, from the config blob's `site_id`
    pub site_id: Option<String>,
    /// Building id -> external alias, from the config blob's `building_aliases`
    pub building_aliases: HashMap<i64, String>,
    /// Constructed transport; `None` when handler construction failed,
    /// making this target a silent no-op at dispatch time
    pub handler: Option<Arc<dyn TargetHandler>>,
    /// point_id ("bd:nm") -> mapping
    pub mappings: HashMap<String, MappingEntry>,
}

impl std::fmt::Debug for TargetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target_type", &self.target_type)
            .field("priority", &self.priority)
            .field("mode", &self.export_mode.kind())
            .field("has_handler", &self.handler.is_some())
            .field("mappings", &self.mappings.len())
            .finish()
    }
}

/// Immutable registry state, swapped wholesale on reload
pub struct TargetSnapshot {
    /// Priority order, ascending dispatched first
    targets: Vec<Arc<TargetEntry>>,
    by_id: HashMap<i64, usize>,
    by_name: HashMap<String, usize>,
    /// Building ids implied by mapped points, for selective subscription
    device_ids: HashSet<i64>,
    pub loaded_at: DateTime<Utc>,
}

impl TargetSnapshot {
    fn empty() -> Self {
        Self {
            targets: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            device_ids: HashSet::new(),
            loaded_at: Utc::now(),
        }
    }

    /// All targets in dispatch (priority) order
    pub fn targets(&self) -> &[Arc<TargetEntry>] {
        &self.targets
    }

    /// Look up a target by name
    pub fn get(&self, name: &str) -> Option<&Arc<TargetEntry>> {
        self.by_name.get(name).map(|&i| &self.targets[i])
    }

    /// Look up a target by id
    pub fn get_by_id(&self, id: i64) -> Option<&Arc<TargetEntry>> {
        self.by_id.get(&id).map(|&i| &self.targets[i])
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets loaded
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Downstream field name for a point, `""` when unmapped
    pub fn field_name(&self, target_id: i64, point_id: &str) -> &str {
        self.mapping(target_id, point_id)
            .map(|m| m.target_field.as_str())
            .unwrap_or("")
    }

    /// Whether a point is mapped for a target
    pub fn is_mapped(&self, target_id: i64, point_id: &str) -> bool {
        self.mapping(target_id, point_id).is_some()
    }

    /// Per-point site override, unset when the mapping has none
    pub fn override_site_id(&self, target_id: i64, point_id: &str) -> Option<&str> {
        self.mapping(target_id, point_id)
            .and_then(|m| m.site_id.as_deref())
    }

    /// Conversion scale for a point, `1.0` when unmapped
    pub fn scale(&self, target_id: i64, point_id: &str) -> f64 {
        self.mapping(target_id, point_id).map(|m| m.scale).unwrap_or(1.0)
    }

    /// Conversion offset for a point, `0.0` when unmapped
    pub fn offset(&self, target_id: i64, point_id: &str) -> f64 {
        self.mapping(target_id, point_id).map(|m| m.offset).unwrap_or(0.0)
    }

    /// External building identifier: the target's configured alias when one
    /// exists, otherwise the numeric id as text
    pub fn external_building_id(&self, target_id: i64, building_id: i64) -> String {
        self.get_by_id(target_id)
            .and_then(|t| t.building_aliases.get(&building_id).cloned())
            .unwrap_or_else(|| building_id.to_string())
    }

    /// Effective site for one dispatch: mapping override, then target-level
    /// site, then the external building id
    pub fn resolve_site(&self, target_id: i64, point_id: &str, building_id: i64) -> String {
        if let Some(site) = self.override_site_id(target_id, point_id) {
            return site.to_string();
        }
        if let Some(site) = self
            .get_by_id(target_id)
            .and_then(|t| t.site_id.as_deref())
        {
            return site.to_string();
        }
        self.external_building_id(target_id, building_id)
    }

    /// Building ids implied by mapped points
    pub fn device_ids(&self) -> &HashSet<i64> {
        &self.device_ids
    }

    fn mapping(&self, target_id: i64, point_id: &str) -> Option<&MappingEntry> {
        self.get_by_id(target_id)
            .and_then(|t| t.mappings.get(point_id))
    }
}

/// Summary of one registry load, for logs and operator status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub targets_loaded: usize,
    pub targets_skipped: usize,
    pub mappings_loaded: usize,
    pub handlers_failed: usize,
}

/// Hot-reloadable target registry
pub struct TargetRegistry {
    store: Arc<dyn ConfigStore>,
    handlers: HandlerRegistry,
    snapshot: RwLock<Arc<TargetSnapshot>>,
}

impl TargetRegistry {
    /// Create an empty registry; call [`load`](Self::load) to populate it
    pub fn new(store: Arc<dyn ConfigStore>, handlers: HandlerRegistry) -> Self {
        Self {
            store,
            handlers,
            snapshot: RwLock::new(Arc::new(TargetSnapshot::empty())),
        }
    }

    /// Current snapshot; cheap, safe to call concurrently with a reload
    pub async fn snapshot(&self) -> Arc<TargetSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Rebuild the snapshot from the store and publish it atomically
    pub async fn load(&self) -> Result<LoadReport> {
        let records = self.store.load_targets().await?;
        let allowlist = self.store.load_target_allowlist().await?;

        let mut report = LoadReport::default();
        let mut kept: Vec<TargetRecord> = Vec::with_capacity(records.len());

        for record in records {
            if !record.enabled {
                continue;
            }
            if !allowlist.is_empty() && !allowlist.contains(&record.name) {
                debug!(
                    "Target '{}' not on gateway allow-list, skipping",
                    record.name
                );
                continue;
            }
            kept.push(record);
        }

        // Ascending priority, unlisted targets appended last, stable
        kept.sort_by_key(|t| (t.priority.is_none(), t.priority));

        let mut targets: Vec<Arc<TargetEntry>> = Vec::with_capacity(kept.len());
        let mut device_ids: HashSet<i64> = HashSet::new();

        for mut record in kept {
            let config = match normalize_config(&record.config) {
                Ok(config) => config,
                Err(reason) => {
                    warn!(
                        "Target '{}' has malformed config ({}), skipping",
                        record.name, reason
                    );
                    report.targets_skipped += 1;
                    continue;
                }
            };
            record.config = config.clone();

            let mapping_rows = self.store.load_mappings(record.id).await?;
            let mut mappings = HashMap::with_capacity(mapping_rows.len());
            for row in mapping_rows {
                match parse_device_id(&row.point_id) {
                    Some(device_id) => {
                        device_ids.insert(device_id);
                    }
                    None => {
                        warn!(
                            "Target '{}' mapping '{}' has no resolvable device id, \
                             omitting from subscription set",
                            record.name, row.point_id
                        );
                    }
                }
                let (point_id, entry) = build_mapping(row);
                mappings.insert(point_id, entry);
            }
            report.mappings_loaded += mappings.len();

            let handler = match self.handlers.get(&record.target_type) {
                Some(factory) => match factory.create(&record) {
                    Ok(handler) => Some(handler),
                    Err(e) => {
                        warn!(
                            "Handler construction for target '{}' (type '{}') failed: {}. \
                             Target will be a no-op until the next reload.",
                            record.name, record.target_type, e
                        );
                        report.handlers_failed += 1;
                        None
                    }
                },
                None => {
                    warn!(
                        "Unknown target type '{}' for target '{}'. Available: {:?}. \
                         Target will be a no-op until the next reload.",
                        record.target_type,
                        record.name,
                        self.handlers.type_names()
                    );
                    report.handlers_failed += 1;
                    None
                }
            };

            let site_id = config
                .get("site_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let building_aliases = parse_building_aliases(&config);

            targets.push(Arc::new(TargetEntry {
                id: record.id,
                name: record.name,
                target_type: record.target_type,
                config,
                export_mode: record.export_mode,
                priority: record.priority,
                template: record.template,
                site_id,
                building_aliases,
                handler,
                mappings,
            }));
            report.targets_loaded += 1;
        }

        let by_id = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        let by_name = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        let next = Arc::new(TargetSnapshot {
            targets,
            by_id,
            by_name,
            device_ids,
            loaded_at: Utc::now(),
        });

        // The only write-lock section: publish the finished snapshot
        *self.snapshot.write().await = next;

        info!(
            "Target registry loaded: {} targets ({} skipped, {} handler failures), {} mappings",
            report.targets_loaded,
            report.targets_skipped,
            report.handlers_failed,
            report.mappings_loaded
        );
        Ok(report)
    }
}

/// Normalize a stored config blob: decode JSON-in-a-string, unwrap a
/// single-element array, and require an object at the end.
fn normalize_config(raw: &Value) -> std::result::Result<Value, String> {
    let decoded = match raw {
        Value::String(s) => {
            serde_json::from_str::<Value>(s).map_err(|e| format!("not valid JSON: {}", e))?
        }
        other => other.clone(),
    };

    let unwrapped = match decoded {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Array(items) => {
            return Err(format!("expected one config object, got array of {}", items.len()))
        }
        other => other,
    };

    match unwrapped {
        Value::Object(_) => Ok(unwrapped),
        other => Err(format!("expected JSON object, got {}", json_type_name(&other))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn build_mapping(row: PointMappingRecord) -> (String, MappingEntry) {
    let (scale, offset) = match &row.conversion {
        Some(conv) => (
            conv.get("scale").and_then(Value::as_f64).unwrap_or(1.0),
            conv.get("offset").and_then(Value::as_f64).unwrap_or(0.0),
        ),
        None => (1.0, 0.0),
    };

    (
        row.point_id,
        MappingEntry {
            target_field: row.target_field,
            site_id: row.site_id,
            scale,
            offset,
        },
    )
}

fn parse_device_id(point_id: &str) -> Option<i64> {
    point_id.split(':').next()?.parse().ok()
}

fn parse_building_aliases(config: &Value) -> HashMap<i64, String> {
    let mut aliases = HashMap::new();
    if let Some(map) = config.get("building_aliases").and_then(Value::as_object) {
        for (key, value) in map {
            if let (Ok(id), Some(alias)) = (key.parse::<i64>(), value.as_str()) {
                aliases.insert(id, alias.to_string());
            }
        }
    }
    aliases
}
