//! Transport handler abstraction
//!
//! One [`TargetHandler`] implementation per transport capability. The
//! contract at this seam is strict: `send` never propagates an error —
//! every transport failure is folded into an `ExportResult` with
//! `success = false`, a message, and (when the transport has one) a status
//! code. Handlers are constructed once per target at registry load time
//! through the [`HandlerRegistry`] factory table.

pub mod file;
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "object-storage")]
pub mod object_storage;

use crate::error::HandlerResult;
use crate::event::{AlarmEvent, ExportResult};
use crate::store::TargetRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A constructed transport for one target
#[async_trait]
pub trait TargetHandler: Send + Sync {
    /// Connectivity / configuration probe, used by the `check` command
    /// and registry diagnostics. Not called on the dispatch path.
    async fn check(&self) -> HandlerResult<()> {
        Ok(())
    }

    /// Deliver one rendered payload.
    ///
    /// `event` carries the dispatch coordinates (building, point) for
    /// transports that route on them; for scheduled bulk exports it is a
    /// synthetic event describing the pull.
    async fn send(&self, event: &AlarmEvent, payload: &Value) -> ExportResult;
}

/// Factory for one target type string
pub trait HandlerFactory: Send + Sync {
    /// Type string this factory serves ("http", "file", ...)
    fn type_name(&self) -> &'static str;

    /// Build a handler for one target.
    ///
    /// Parses and validates the target's (already unwrapped) config blob;
    /// failure here makes the target a no-op at dispatch time, it never
    /// fails the registry load.
    fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>>;
}

/// Registration table mapping target-type strings to factories
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in handlers registered
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http::HttpHandlerFactory));
        registry.register(Arc::new(file::FileHandlerFactory));
        #[cfg(feature = "object-storage")]
        registry.register(Arc::new(object_storage::ObjectStorageHandlerFactory));
        #[cfg(feature = "mqtt")]
        registry.register(Arc::new(mqtt::MqttHandlerFactory));
        registry
    }

    /// Register a factory under its type name
    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories
            .insert(factory.type_name().to_string(), factory);
    }

    /// Look up a factory by target type string
    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn HandlerFactory>> {
        self.factories.get(type_name)
    }

    /// Check if a type string is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names
    pub fn type_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtin_handlers()
    }
}
