//! Live pub/sub ingress
//!
//! Subscribes to the configured channel patterns and feeds alarm events
//! into the coordinator's dispatch pipeline. Routing is by channel prefix:
//! `alarms:` carries events, `system:` carries operator notifications
//! (live reload commands), `schedules:` is informational here (the
//! scheduled exporter polls its own records).
//!
//! A lost bus connection reconnects with capped exponential backoff; a
//! malformed message is logged and dropped. Neither ever takes the
//! process down.

use crate::bus::{BusMessage, MessageBus};
use crate::config::BusConfig;
use crate::coordinator::ExportCoordinator;
use crate::event::AlarmEvent;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Channel prefix carrying alarm/value events
const ALARM_PREFIX: &str = "alarms:";
/// Channel prefix carrying schedule notifications
const SCHEDULE_PREFIX: &str = "schedules:";
/// Channel prefix carrying system/operator notifications
const SYSTEM_PREFIX: &str = "system:";

/// Pub/sub event subscriber
pub struct EventSubscriber {
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<ExportCoordinator>,
    config: BusConfig,
    selective: bool,
}

impl EventSubscriber {
    /// Create a subscriber bound to one coordinator
    pub fn new(
        bus: Arc<dyn MessageBus>,
        coordinator: Arc<ExportCoordinator>,
        config: BusConfig,
        selective: bool,
    ) -> Self {
        Self {
            bus,
            coordinator,
            config,
            selective,
        }
    }

    /// Subscribe-and-route loop; returns when shutdown is signalled
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut backoff_ms = self.config.reconnect_min_ms;
        let health = self.coordinator.health_state();

        loop {
            match self.bus.subscribe(&self.config.channels).await {
                Ok(mut stream) => {
                    info!(
                        "Subscriber connected, channels: {:?}",
                        self.config.channels
                    );
                    health.write().await.bus_connected = true;
                    backoff_ms = self.config.reconnect_min_ms;

                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => {
                                debug!("Subscriber shutting down");
                                health.write().await.bus_connected = false;
                                return;
                            }
                            msg = stream.next() => match msg {
                                Some(msg) => self.route(msg).await,
                                None => {
                                    warn!("Bus stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    health.write().await.bus_connected = false;
                }
                Err(e) => {
                    health.write().await.bus_connected = false;
                    warn!("Bus subscribe failed: {}, retrying in {}ms", e, backoff_ms);
                }
            }

            // Shutdown-aware reconnect backoff
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            backoff_ms = (backoff_ms * 2).min(self.config.reconnect_max_ms);
        }
    }

    /// Route one message by channel prefix
    async fn route(&self, msg: BusMessage) {
        if msg.channel.starts_with(ALARM_PREFIX) {
            self.handle_alarm_message(&msg).await;
        } else if msg.channel.starts_with(SYSTEM_PREFIX) {
            self.handle_system_message(&msg).await;
        } else if msg.channel.starts_with(SCHEDULE_PREFIX) {
            debug!("Schedule notification on '{}' (polled path handles it)", msg.channel);
        } else {
            debug!("Message on unrouted channel '{}', ignoring", msg.channel);
        }
    }

    async fn handle_alarm_message(&self, msg: &BusMessage) {
        let event: AlarmEvent = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Malformed event on '{}' ({} bytes): {}, dropping",
                    msg.channel,
                    msg.payload.len(),
                    e
                );
                return;
            }
        };

        if self.selective {
            let snapshot = self.coordinator.registry().snapshot().await;
            if !snapshot.device_ids().contains(&event.building_id) {
                self.coordinator.count_filtered_event();
                debug!(
                    "Event for building {} outside assigned device set, dropping",
                    event.building_id
                );
                return;
            }
        }

        self.coordinator.handle_alarm_event(&event).await;
    }

    async fn handle_system_message(&self, msg: &BusMessage) {
        // Accept both a bare command string and {"cmd": "..."}
        let text = String::from_utf8_lossy(&msg.payload);
        let command = serde_json::from_slice::<serde_json::Value>(&msg.payload)
            .ok()
            .and_then(|v| v.get("cmd").and_then(|c| c.as_str()).map(str::to_string))
            .unwrap_or_else(|| text.trim().trim_matches('"').to_string());

        match command.as_str() {
            "reload-targets" => {
                info!("System notification: reloading targets");
                if let Err(e) = self.coordinator.reload_targets().await {
                    warn!("Target reload failed: {}", e);
                }
            }
            "reload-templates" => {
                info!("System notification: reloading templates");
                if let Err(e) = self.coordinator.reload_templates().await {
                    warn!("Template reload failed: {}", e);
                }
            }
            other => {
                debug!("Unknown system notification '{}', ignoring", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::ServiceConfig;
    use crate::error::HandlerResult;
    use crate::event::ExportResult;
    use crate::handlers::{HandlerFactory, HandlerRegistry, TargetHandler};
    use crate::mode::ExportMode;
    use crate::store::{MemoryStore, PointMappingRecord, TargetRecord};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingHandler {
        target_id: i64,
        target_name: String,
        sends: Arc<AtomicU64>,
    }

    #[async_trait]
    impl TargetHandler for CountingHandler {
        async fn send(&self, _event: &AlarmEvent, _payload: &Value) -> ExportResult {
            self.sends.fetch_add(1, Ordering::SeqCst);
            ExportResult::ok(self.target_id, &self.target_name)
        }
    }

    struct CountingFactory {
        sends: Arc<AtomicU64>,
    }

    impl HandlerFactory for CountingFactory {
        fn type_name(&self) -> &'static str {
            "counting"
        }
        fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>> {
            Ok(Arc::new(CountingHandler {
                target_id: target.id,
                target_name: target.name.clone(),
                sends: self.sends.clone(),
            }))
        }
    }

    async fn setup(
        selective: bool,
    ) -> (
        Arc<MemoryBus>,
        Arc<ExportCoordinator>,
        Arc<MemoryStore>,
        Arc<AtomicU64>,
        broadcast::Sender<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let store = Arc::new(MemoryStore::new());
        store
            .set_targets(vec![TargetRecord {
                id: 1,
                name: "t".to_string(),
                target_type: "counting".to_string(),
                enabled: true,
                config: serde_json::json!({}),
                export_mode: ExportMode::default(),
                priority: None,
                template: None,
            }])
            .await;
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

        let sends = Arc::new(AtomicU64::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(CountingFactory {
            sends: sends.clone(),
        }));

        let bus = Arc::new(MemoryBus::new(64));
        let mut config = ServiceConfig::default();
        config.selective_subscription = selective;

        let coordinator = ExportCoordinator::with_handlers(
            config.clone(),
            store.clone(),
            bus.clone(),
            handlers,
        );
        coordinator.registry().load().await.unwrap();

        let subscriber = EventSubscriber::new(
            bus.clone(),
            coordinator.clone(),
            config.bus.clone(),
            selective,
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { subscriber.run(shutdown_rx).await });

        // Let the subscriber attach before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;
        (bus, coordinator, store, sends, shutdown_tx, task)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_alarm_message_dispatches() {
        let (bus, coordinator, _store, sends, shutdown_tx, task) = setup(false).await;

        let event = AlarmEvent::new(7, "temp", 21.5).with_alarm(1);
        bus.publish("alarms:all", serde_json::to_vec(&event).unwrap());
        settle().await;

        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().alarm_events, 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (bus, coordinator, _store, sends, shutdown_tx, task) = setup(false).await;

        bus.publish("alarms:all", b"{definitely not json".to_vec());
        let event = AlarmEvent::new(7, "temp", 1.0);
        bus.publish("alarms:all", serde_json::to_vec(&event).unwrap());
        settle().await;

        // The bad message was skipped, the good one processed
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().alarm_events, 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_selective_subscription_filters_unassigned() {
        let (bus, coordinator, _store, sends, shutdown_tx, task) = setup(true).await;

        // Building 99 is not in the mapped device set {7}
        let stranger = AlarmEvent::new(99, "temp", 1.0);
        bus.publish("alarms:all", serde_json::to_vec(&stranger).unwrap());
        let assigned = AlarmEvent::new(7, "temp", 1.0);
        bus.publish("alarms:all", serde_json::to_vec(&assigned).unwrap());
        settle().await;

        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().events_filtered, 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_system_reload_targets() {
        let (bus, coordinator, store, _sends, shutdown_tx, task) = setup(false).await;
        assert_eq!(coordinator.registry().snapshot().await.len(), 1);

        // Remove all targets, then ask for a live reload
        store.set_targets(vec![]).await;
        bus.publish("system:notify", br#"{"cmd":"reload-targets"}"#.to_vec());
        settle().await;

        assert_eq!(coordinator.registry().snapshot().await.len(), 0);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bus_connected_flag_follows_lifecycle() {
        let (_bus, coordinator, _store, _sends, shutdown_tx, task) = setup(false).await;

        assert!(coordinator.health_state().read().await.bus_connected);
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!coordinator.health_state().read().await.bus_connected);
    }
}
