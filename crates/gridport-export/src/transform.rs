//! Payload transformation layer
//!
//! Turns a normalized [`PayloadContext`] into the JSON document a downstream
//! system expects, driven by a template. [`render`] is a pure function — no
//! current-template global, no mutable state — so any number of dispatch
//! tasks can render different templates concurrently.
//!
//! Placeholders use `{{key}}` syntax. A string value that is exactly one
//! placeholder is replaced by the context value with its JSON type
//! preserved; placeholders embedded in longer strings render as text.
//! Unknown placeholders resolve to `null` (whole-string) or the empty
//! string (embedded), never an error.

use crate::event::AlarmEvent;
use crate::store::TemplateRecord;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::sync::RwLock;
use tracing::debug;

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([a-zA-Z0-9_.]+)\}\}").expect("placeholder regex pattern is invalid - this is a bug")
});

/// Substitution context for one render call
#[derive(Debug, Clone, Default)]
pub struct PayloadContext {
    values: HashMap<String, Value>,
}

impl PayloadContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard context for one event dispatch
    pub fn from_event(
        event: &AlarmEvent,
        field_name: &str,
        description: &str,
        converted_value: f64,
        formatted_value: &str,
        site_id: &str,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.insert("building_id", Value::from(event.building_id));
        ctx.insert("point_name", Value::from(event.point_name.clone()));
        ctx.insert("field", Value::from(field_name));
        ctx.insert("value", Value::from(converted_value));
        ctx.insert("raw_value", Value::from(event.value));
        ctx.insert("formatted_value", Value::from(formatted_value));
        ctx.insert("timestamp", Value::from(event.timestamp.to_rfc3339()));
        ctx.insert("site_id", Value::from(site_id));
        ctx.insert("alarm", Value::from(event.alarm_flag));
        ctx.insert("status", Value::from(event.status));
        ctx.insert("description", Value::from(description));
        ctx
    }

    /// Insert or replace one context value
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Look up a context value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Render a template against a context.
///
/// Pure: identical inputs always produce identical output.
pub fn render(template: &Value, ctx: &PayloadContext) -> Value {
    match template {
        Value::String(s) => render_string(s, ctx),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (render_text(k, ctx), render(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, ctx)).collect()),
        other => other.clone(),
    }
}

fn render_string(s: &str, ctx: &PayloadContext) -> Value {
    // Whole-string placeholder keeps the context value's JSON type
    if let Some(caps) = PLACEHOLDER_REGEX.captures(s) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == s.len() {
                return ctx
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or(Value::Null);
            }
        }
    }

    Value::String(render_text(s, ctx))
}

fn render_text(s: &str, ctx: &PayloadContext) -> String {
    PLACEHOLDER_REGEX
        .replace_all(s, |caps: &regex::Captures<'_>| {
            match ctx.get(&caps[1]) {
                Some(Value::String(v)) => v.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// Built-in template: generic field/value/timestamp document
fn standard_template() -> Value {
    serde_json::json!({
        "point": "{{field}}",
        "value": "{{value}}",
        "timestamp": "{{timestamp}}",
        "site": "{{site_id}}",
        "quality": "{{status}}"
    })
}

/// Built-in template: flat key/value for site-keyed collectors
fn site_kv_template() -> Value {
    serde_json::json!({
        "{{site_id}}.{{field}}": "{{value}}",
        "ts": "{{timestamp}}"
    })
}

/// Built-in template: alarm notification with a composed message
fn alarm_notify_template() -> Value {
    serde_json::json!({
        "source": {
            "site": "{{site_id}}",
            "building": "{{building_id}}",
            "point": "{{point_name}}"
        },
        "alarm": "{{alarm}}",
        "message": "{{description}} ({{field}} = {{formatted_value}})",
        "value": "{{value}}",
        "occurred_at": "{{timestamp}}"
    })
}

/// Name of the fallback template used when a target names none
pub const STANDARD_TEMPLATE: &str = "standard";

/// Named template collection: built-ins plus store-loaded custom templates.
///
/// Custom templates shadow built-ins with the same name. Lookups clone the
/// template `Value`, so a reload never mutates a render already in flight.
pub struct TemplateLibrary {
    custom: RwLock<HashMap<String, Value>>,
}

impl TemplateLibrary {
    /// Library with only the built-in templates
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a template by name, falling back to the standard template
    pub async fn get(&self, name: &str) -> Value {
        if let Some(custom) = self.custom.read().await.get(name) {
            return custom.clone();
        }
        match name {
            "site-kv" => site_kv_template(),
            "alarm-notify" => alarm_notify_template(),
            STANDARD_TEMPLATE => standard_template(),
            other => {
                debug!("Unknown template '{}', using standard", other);
                standard_template()
            }
        }
    }

    /// Replace the custom template set from store records
    pub async fn reload(&self, records: Vec<TemplateRecord>) {
        let mut next = HashMap::with_capacity(records.len());
        for record in records {
            if record.active {
                next.insert(record.name, record.template);
            }
        }
        let count = next.len();
        *self.custom.write().await = next;
        debug!("Template library reloaded, {} custom templates", count);
    }

    /// Number of custom templates currently loaded
    pub async fn custom_count(&self) -> usize {
        self.custom.read().await.len()
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::new()
    }
}
