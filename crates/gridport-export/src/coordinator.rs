//! Export coordination
//!
//! [`ExportCoordinator`] owns the process-lifetime services — target
//! registry, template library, export log, health state — and wires the two
//! ingress paths (subscriber, scheduler) to the dispatch pipeline. It is
//! constructed explicitly and passed by `Arc` to its consumers; there are
//! no hidden globals.
//!
//! Dispatch pipeline for one event: resolve matching targets in priority
//! order, run each target's export-mode engine, render the payload, send
//! through the target's handler, record stats/health, enqueue the log
//! entry. One target's failure never blocks or fails another's dispatch.

use crate::bus::MessageBus;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::event::{AlarmEvent, ExportLogEntry, ExportResult};
use crate::export_log::{ExportLogService, ExportLogStatsSnapshot};
use crate::handlers::HandlerRegistry;
use crate::health::{HealthState, SharedHealthState};
use crate::mode::{ExportModeEngine, ModeDecision};
use crate::registry::{LoadReport, TargetEntry, TargetRegistry, TargetSnapshot};
use crate::scheduler::ScheduledExporter;
use crate::store::ConfigStore;
use crate::subscriber::EventSubscriber;
use crate::transform::{self, PayloadContext, TemplateLibrary, STANDARD_TEMPLATE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Split a `"<building_id>:<point_name>"` mapping key; unparseable
/// building ids resolve to 0
fn split_point_id(point_id: &str) -> (i64, &str) {
    match point_id.split_once(':') {
        Some((building, point)) => (building.parse().unwrap_or(0), point),
        None => (0, point_id),
    }
}

/// Lock-free aggregate counters
#[derive(Debug, Default)]
pub struct ExportStats {
    pub alarm_events: AtomicU64,
    pub exports_total: AtomicU64,
    pub exports_success: AtomicU64,
    pub exports_failed: AtomicU64,
    pub events_filtered: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ExportStatsSnapshot {
    pub alarm_events: u64,
    pub exports_total: u64,
    pub exports_success: u64,
    pub exports_failed: u64,
    pub events_filtered: u64,
}

/// Per-target engine slot: decision state plus the last event seen, kept
/// so manual batch flushes have dispatch coordinates
struct EngineSlot {
    engine: ExportModeEngine,
    last_event: AlarmEvent,
}

/// Top-level orchestrator
pub struct ExportCoordinator {
    config: ServiceConfig,
    store: Arc<dyn ConfigStore>,
    bus: Arc<dyn MessageBus>,
    registry: Arc<TargetRegistry>,
    templates: Arc<TemplateLibrary>,
    export_log: Arc<ExportLogService>,
    health: SharedHealthState,
    stats: ExportStats,
    engines: Mutex<HashMap<i64, EngineSlot>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExportCoordinator {
    /// Construct the coordinator and its owned services. Nothing runs
    /// until [`start`](Self::start).
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ConfigStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        Self::with_handlers(config, store, bus, HandlerRegistry::with_builtin_handlers())
    }

    /// Construct with a custom handler registry (tests, embedders)
    pub fn with_handlers(
        config: ServiceConfig,
        store: Arc<dyn ConfigStore>,
        bus: Arc<dyn MessageBus>,
        handlers: HandlerRegistry,
    ) -> Arc<Self> {
        let registry = Arc::new(TargetRegistry::new(store.clone(), handlers));
        let export_log = Arc::new(ExportLogService::new(
            store.clone(),
            config.export_log.to_export_log_config(),
        ));
        let health = Arc::new(RwLock::new(HealthState::new(config.health.window)));
        let (shutdown_tx, _) = broadcast::channel(4);

        Arc::new(Self {
            config,
            store,
            bus,
            registry,
            templates: Arc::new(TemplateLibrary::new()),
            export_log,
            health,
            stats: ExportStats::default(),
            engines: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Whether the coordinator is in the Running state
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared health state (subscriber updates bus connectivity here)
    pub fn health_state(&self) -> SharedHealthState {
        self.health.clone()
    }

    /// Target registry (read-side)
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Service configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Transition Stopped -> Running: load configuration, start the log
    /// consumer, subscriber, scheduler, and health endpoint.
    ///
    /// Calling `start` while already running returns success without side
    /// effects.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already running, start is a no-op");
            return Ok(());
        }

        let report = self.registry.load().await?;
        info!(
            "Coordinator starting with {} targets ({} mappings)",
            report.targets_loaded, report.mappings_loaded
        );
        self.templates
            .reload(self.store.load_templates().await?)
            .await;
        self.engines.lock().await.clear();

        self.health.write().await.started_at = Some(Instant::now());
        self.export_log.start();

        let mut tasks = self.tasks.lock().await;

        let subscriber = EventSubscriber::new(
            self.bus.clone(),
            Arc::clone(self),
            self.config.bus.clone(),
            self.config.selective_subscription,
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            subscriber.run(shutdown_rx).await;
        }));

        if self.config.scheduler.enabled {
            let scheduler = ScheduledExporter::new(
                self.store.clone(),
                Arc::clone(self),
                self.config.scheduler.clone(),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            }));
        }

        if self.config.health.enabled {
            let settings = self.config.health.clone();
            let state = self.health.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = crate::health::start_health_server(settings, state).await {
                    warn!("Health endpoint terminated: {}", e);
                }
            }));
        }

        Ok(())
    }

    /// Transition Running -> Stopped: flush pending batches, signal every
    /// loop, join tasks, and drain the export log.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Coordinator stopping");

        self.flush_batches().await;

        let _ = self.shutdown_tx.send(());
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            // The health listener has no shutdown path of its own
            task.abort();
            let _ = task.await;
        }
        drop(tasks);

        self.export_log.shutdown().await;
        info!("Coordinator stopped");
    }

    /// Dispatch one live event to every matching target, in priority order.
    ///
    /// Returns one `ExportResult` per target that actually dispatched
    /// (mode decisions of Buffer/Drop and handler-less targets produce
    /// none).
    pub async fn handle_alarm_event(&self, event: &AlarmEvent) -> Vec<ExportResult> {
        self.stats.alarm_events.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.registry.snapshot().await;
        let point_key = event.point_key();

        // Phase 1: mode decisions under the engine lock, no I/O
        let mut to_dispatch: Vec<(Arc<TargetEntry>, Vec<f64>)> = Vec::new();
        {
            let mut engines = self.engines.lock().await;
            let now = Instant::now();

            for target in snapshot.targets() {
                if !snapshot.is_mapped(target.id, &point_key) {
                    continue;
                }

                let slot = engines.entry(target.id).or_insert_with(|| EngineSlot {
                    engine: ExportModeEngine::new(target.export_mode.clone()),
                    last_event: event.clone(),
                });
                slot.last_event = event.clone();

                match slot.engine.process(event.value, now) {
                    ModeDecision::Send(values) => {
                        to_dispatch.push((target.clone(), values));
                    }
                    ModeDecision::Buffer | ModeDecision::Drop => {}
                }
            }
        }

        // Phase 2: transform + send, engine lock released
        let mut results = Vec::with_capacity(to_dispatch.len());
        for (target, values) in to_dispatch {
            if let Some(result) = self
                .dispatch_values(&snapshot, &target, event, &values)
                .await
            {
                results.push(result);
            }
        }
        results
    }

    /// Dispatch a batch of events sequentially
    pub async fn handle_alarm_batch(&self, events: &[AlarmEvent]) -> Vec<ExportResult> {
        let mut results = Vec::new();
        for event in events {
            results.extend(self.handle_alarm_event(event).await);
        }
        results
    }

    /// Flush every pending batch buffer, dispatching with each target's
    /// last-seen event coordinates. Manual operation; also runs on stop.
    pub async fn flush_batches(&self) -> Vec<ExportResult> {
        let snapshot = self.registry.snapshot().await;

        let mut pending: Vec<(Arc<TargetEntry>, Vec<f64>, AlarmEvent)> = Vec::new();
        {
            let mut engines = self.engines.lock().await;
            let now = Instant::now();
            for (target_id, slot) in engines.iter_mut() {
                if slot.engine.buffered() == 0 {
                    continue;
                }
                let Some(target) = snapshot.get_by_id(*target_id) else {
                    continue;
                };
                let values = slot.engine.flush_batch(now);
                if !values.is_empty() {
                    pending.push((target.clone(), values, slot.last_event.clone()));
                }
            }
        }

        let mut results = Vec::with_capacity(pending.len());
        for (target, values, event) in pending {
            if let Some(result) = self
                .dispatch_values(&snapshot, &target, &event, &values)
                .await
            {
                results.push(result);
            }
        }
        results
    }

    /// Render and send one set of values to one target.
    ///
    /// Returns `None` for handler-less (no-op) targets and transform
    /// failures; both are counted, neither affects other targets.
    pub(crate) async fn dispatch_values(
        &self,
        snapshot: &TargetSnapshot,
        target: &TargetEntry,
        event: &AlarmEvent,
        values: &[f64],
    ) -> Option<ExportResult> {
        let Some(handler) = target.handler.as_ref() else {
            debug!(
                "Target '{}' has no handler (construction failed at load), skipping dispatch",
                target.name
            );
            return None;
        };

        let point_key = event.point_key();
        let field = snapshot.field_name(target.id, &point_key);
        let scale = snapshot.scale(target.id, &point_key);
        let offset = snapshot.offset(target.id, &point_key);
        let site = snapshot.resolve_site(target.id, &point_key, event.building_id);
        let template_name = target.template.as_deref().unwrap_or(STANDARD_TEMPLATE);
        let template = self.templates.get(template_name).await;

        let render_one = |value: f64| -> Value {
            let converted = value * scale + offset;
            let ctx = PayloadContext::from_event(
                event,
                field,
                &event.description,
                converted,
                &format!("{:.2}", converted),
                &site,
            );
            transform::render(&template, &ctx)
        };

        let payload = match values {
            [] => return None,
            [single] => render_one(*single),
            many => Value::Array(many.iter().map(|v| render_one(*v)).collect()),
        };

        let result = handler.send(event, &payload).await;

        self.stats.exports_total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.stats.exports_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.exports_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dispatch to target '{}' failed: {}",
                target.name,
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }

        self.health.write().await.record_dispatch(
            target.id,
            &target.name,
            result.success,
            result.error_message.as_deref(),
        );

        let source_value = *values.last().unwrap_or(&event.value);
        let converted_value = source_value * scale + offset;
        self.export_log.enqueue(ExportLogEntry::from_result(
            &result,
            point_key,
            source_value,
            converted_value,
            payload.to_string(),
            &self.config.client_id,
        ));

        Some(result)
    }

    /// Render and send one bulk pull (scheduled-export path) to one
    /// target: one handler call carrying an array with one document per
    /// history row, each rendered with that row's point mapping and
    /// conversion. Bypasses the export-mode engine by design.
    ///
    /// Returns `None` when the target is missing or handler-less.
    pub async fn dispatch_bulk(
        &self,
        target_id: i64,
        rows: &[crate::store::HistoryRow],
    ) -> Option<ExportResult> {
        let snapshot = self.registry.snapshot().await;
        let target = snapshot.get_by_id(target_id)?;
        let handler = target.handler.as_ref()?;
        if rows.is_empty() {
            return None;
        }

        let template_name = target.template.as_deref().unwrap_or(STANDARD_TEMPLATE);
        let template = self.templates.get(template_name).await;

        let mut docs = Vec::with_capacity(rows.len());
        let mut last_converted = 0.0;
        for row in rows {
            let (building_id, point_name) = split_point_id(&row.point_id);
            let field = snapshot.field_name(target.id, &row.point_id);
            let scale = snapshot.scale(target.id, &row.point_id);
            let offset = snapshot.offset(target.id, &row.point_id);
            let site = snapshot.resolve_site(target.id, &row.point_id, building_id);
            let converted = row.value * scale + offset;
            last_converted = converted;

            let row_event = AlarmEvent::new(building_id, point_name, row.value)
                .with_timestamp(row.timestamp);
            let ctx = PayloadContext::from_event(
                &row_event,
                field,
                "",
                converted,
                &format!("{:.2}", converted),
                &site,
            );
            docs.push(transform::render(&template, &ctx));
        }
        let payload = Value::Array(docs);

        // Synthetic event gives transports routing coordinates for the pull
        let pull_event = AlarmEvent::new(
            split_point_id(&rows[0].point_id).0,
            "scheduled-export",
            rows.last().map(|r| r.value).unwrap_or_default(),
        );
        let result = handler.send(&pull_event, &payload).await;

        self.stats.exports_total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.stats.exports_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.exports_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.health.write().await.record_dispatch(
            target.id,
            &target.name,
            result.success,
            result.error_message.as_deref(),
        );

        let source_value = rows.last().map(|r| r.value).unwrap_or_default();
        self.export_log.enqueue(ExportLogEntry::from_result(
            &result,
            "",
            source_value,
            last_converted,
            payload.to_string(),
            &self.config.client_id,
        ));

        Some(result)
    }

    /// Reload targets and mappings from the store.
    ///
    /// Mode-engine state is reset wholesale: a reload re-arms every
    /// target's decision state, discarding buffered data.
    pub async fn reload_targets(&self) -> Result<LoadReport> {
        let report = self.registry.load().await?;
        self.engines.lock().await.clear();

        let snapshot = self.registry.snapshot().await;
        self.health
            .write()
            .await
            .retain_targets(&|id| snapshot.get_by_id(id).is_some());

        info!(
            "Targets reloaded: {} active, {} skipped",
            report.targets_loaded, report.targets_skipped
        );
        Ok(report)
    }

    /// Reload payload templates from the store
    pub async fn reload_templates(&self) -> Result<()> {
        self.templates
            .reload(self.store.load_templates().await?)
            .await;
        info!(
            "Templates reloaded, {} custom templates active",
            self.templates.custom_count().await
        );
        Ok(())
    }

    /// Counter snapshot
    pub fn stats(&self) -> ExportStatsSnapshot {
        ExportStatsSnapshot {
            alarm_events: self.stats.alarm_events.load(Ordering::Relaxed),
            exports_total: self.stats.exports_total.load(Ordering::Relaxed),
            exports_success: self.stats.exports_success.load(Ordering::Relaxed),
            exports_failed: self.stats.exports_failed.load(Ordering::Relaxed),
            events_filtered: self.stats.events_filtered.load(Ordering::Relaxed),
        }
    }

    /// Export log counters
    pub fn export_log_stats(&self) -> ExportLogStatsSnapshot {
        self.export_log.stats()
    }

    /// Count an event dropped by the selective-subscription filter
    pub(crate) fn count_filtered_event(&self) {
        self.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Component status document for operator queries
    pub async fn component_status(&self) -> Value {
        let snapshot = self.registry.snapshot().await;
        let log_stats = self.export_log.stats();
        serde_json::json!({
            "running": self.is_running(),
            "targets": snapshot.len(),
            "registry_loaded_at": snapshot.loaded_at.to_rfc3339(),
            "stats": self.stats(),
            "export_log": {
                "queue_depth": self.export_log.queue_depth(),
                "enqueued": log_stats.enqueued,
                "persisted": log_stats.persisted,
                "dropped": log_stats.dropped,
                "persist_failures": log_stats.persist_failures,
            },
        })
    }

    /// Health document (overall + per-target rolling health)
    pub async fn health_check(&self) -> Value {
        self.health.read().await.to_json()
    }
}
