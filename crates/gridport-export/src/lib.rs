//! gridport-export - Export coordination engine for the Gridport gateway
//!
//! Gridport collects data from industrial devices and re-exports alarms and
//! periodic snapshots to heterogeneous downstream systems. This crate is
//! the export side: a pub/sub-driven dispatcher that resolves which
//! configured targets care about each incoming event, applies a per-target
//! throttling/batching policy, renders the payload into the target's
//! expected shape, sends it through a pluggable transport, and durably
//! logs the outcome — without blocking ingestion or losing events under
//! partial failure.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌────────────────────────────────────────────────┐
//! │  pub/sub bus   │──▶│ EventSubscriber ─┐                             │
//! └────────────────┘   │                  ▼                             │
//! ┌────────────────┐   │        ExportCoordinator                       │
//! │ schedule table │──▶│ ScheduledExporter│                             │
//! └────────────────┘   │                  ▼                             │
//!                      │  TargetRegistry ─▶ ExportModeEngine            │
//!                      │        │                 │                     │
//!                      │        ▼                 ▼                     │
//!                      │  PayloadTransformer ─▶ TargetHandler           │
//!                      │        │            (http/s3/file/mqtt)        │
//!                      │        ▼                 │                     │
//!                      │  ExportLogService ◀──────┘                     │
//!                      └────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use gridport_export::{ExportCoordinator, MemoryStore, MemoryBus, ServiceConfig};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let bus = Arc::new(MemoryBus::new(1024));
//! let coordinator = ExportCoordinator::new(ServiceConfig::default(), store, bus);
//! coordinator.start().await?;
//! ```

// Core pipeline modules
pub mod coordinator;
pub mod mode;
pub mod registry;
pub mod transform;

// Ingress paths
pub mod bus;
pub mod scheduler;
pub mod subscriber;

// Egress transports
pub mod handlers;

// Shared types and seams
pub mod config;
pub mod error;
pub mod event;
pub mod export_log;
pub mod health;
pub mod store;
pub mod types;

// Re-export the primary surface at crate root for ergonomic use
pub use bus::{BusMessage, MemoryBus, MessageBus};
#[cfg(feature = "redis-bus")]
pub use bus::RedisBus;
pub use config::{BusConfig, ServiceConfig};
pub use coordinator::{ExportCoordinator, ExportStatsSnapshot};
pub use error::{ExportError, HandlerError, HandlerResult, Result};
pub use event::{AlarmEvent, ExportLogEntry, ExportResult};
pub use export_log::{ExportLogConfig, ExportLogService};
pub use handlers::{HandlerFactory, HandlerRegistry, TargetHandler};
pub use health::{HealthState, SharedHealthState, TargetHealth};
pub use mode::{ExportMode, ExportModeEngine, ModeDecision};
pub use registry::{LoadReport, MappingEntry, TargetRegistry, TargetSnapshot};
pub use scheduler::ScheduledExporter;
pub use store::{
    ConfigStore, HistoryRow, MemoryStore, PointMappingRecord, ScheduleRecord, TargetRecord,
    TemplateRecord,
};
pub use subscriber::EventSubscriber;
pub use transform::{render, PayloadContext, TemplateLibrary};
pub use types::SensitiveString;

// Re-export commonly used dependencies for handler implementations
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value as JsonValue;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        async_trait, AlarmEvent, BusMessage, ConfigStore, Deserialize, ExportCoordinator,
        ExportError, ExportLogEntry, ExportMode, ExportModeEngine, ExportResult, HandlerError,
        HandlerFactory, HandlerRegistry, HandlerResult, JsonValue, LoadReport, MemoryBus,
        MemoryStore, MessageBus, ModeDecision, PayloadContext, Result, SensitiveString, Serialize,
        ServiceConfig, TargetHandler, TargetRecord, TargetRegistry, TemplateLibrary,
    };
}
