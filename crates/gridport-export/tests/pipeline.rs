//! End-to-end pipeline test: events published on the in-process bus flow
//! through subscriber -> registry -> mode engine -> transformer -> handler,
//! and every dispatch lands in the export log.

use async_trait::async_trait;
use gridport_export::prelude::*;
use gridport_export::store::PointMappingRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Handler that records payloads and can be told to fail
struct RecordingHandler {
    target_id: i64,
    target_name: String,
    payloads: Arc<Mutex<Vec<JsonValue>>>,
    fail: Arc<AtomicU64>,
}

#[async_trait]
impl TargetHandler for RecordingHandler {
    async fn send(&self, _event: &AlarmEvent, payload: &JsonValue) -> ExportResult {
        self.payloads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(payload.clone());
        if self.fail.load(Ordering::SeqCst) > 0 {
            self.fail.fetch_sub(1, Ordering::SeqCst);
            ExportResult::failure(self.target_id, &self.target_name, "simulated outage")
        } else {
            ExportResult::ok(self.target_id, &self.target_name).with_data_size(32)
        }
    }
}

struct RecordingFactory {
    payloads: Arc<Mutex<Vec<JsonValue>>>,
    fail: Arc<AtomicU64>,
}

impl HandlerFactory for RecordingFactory {
    fn type_name(&self) -> &'static str {
        "recording"
    }

    fn create(
        &self,
        target: &TargetRecord,
    ) -> HandlerResult<Arc<dyn TargetHandler>> {
        Ok(Arc::new(RecordingHandler {
            target_id: target.id,
            target_name: target.name.clone(),
            payloads: self.payloads.clone(),
            fail: self.fail.clone(),
        }))
    }
}

struct Pipeline {
    bus: Arc<MemoryBus>,
    store: Arc<MemoryStore>,
    coordinator: Arc<ExportCoordinator>,
    payloads: Arc<Mutex<Vec<JsonValue>>>,
    fail: Arc<AtomicU64>,
}

async fn pipeline_with_target(mode: ExportMode) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    store
        .set_targets(vec![TargetRecord {
            id: 1,
            name: "downstream".to_string(),
            target_type: "recording".to_string(),
            enabled: true,
            config: serde_json::json!({"site_id": "plant-7"}),
            export_mode: mode,
            priority: Some(1),
            template: None,
        }])
        .await;
    store
        .add_mappings(
            1,
            vec![PointMappingRecord {
                target_id: 1,
                point_id: "7:supply_temp".to_string(),
                target_field: "temperature".to_string(),
                site_id: None,
                conversion: Some(serde_json::json!({"scale": 1.0, "offset": 0.0})),
            }],
        )
        .await;

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicU64::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(RecordingFactory {
        payloads: payloads.clone(),
        fail: fail.clone(),
    }));

    let bus = Arc::new(MemoryBus::new(256));
    let mut config = ServiceConfig::default();
    config.scheduler.enabled = false;
    config.export_log.flush_interval_ms = 20;

    let coordinator =
        ExportCoordinator::with_handlers(config, store.clone(), bus.clone(), handlers);
    coordinator.start().await.expect("coordinator starts");

    // Give the subscriber a moment to attach to the bus
    tokio::time::sleep(Duration::from_millis(50)).await;

    Pipeline {
        bus,
        store,
        coordinator,
        payloads,
        fail,
    }
}

fn publish(bus: &MemoryBus, channel: &str, event: &AlarmEvent) {
    bus.publish(channel, serde_json::to_vec(event).unwrap());
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_on_change_pipeline_end_to_end() {
    let pipeline = pipeline_with_target(ExportMode::OnChange {
        threshold: 1.0,
        force_first_send: true,
    })
    .await;

    for value in [25.0, 25.5, 25.8, 27.0] {
        publish(
            &pipeline.bus,
            "alarms:all",
            &AlarmEvent::new(7, "supply_temp", value).with_alarm(1),
        );
    }
    settle().await;

    // Threshold 1.0 admits 25.0 and 27.0 only
    {
        let payloads = pipeline.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["value"], 25.0);
        assert_eq!(payloads[0]["point"], "temperature");
        assert_eq!(payloads[0]["site"], "plant-7");
        assert_eq!(payloads[1]["value"], 27.0);
    }

    let stats = pipeline.coordinator.stats();
    assert_eq!(stats.alarm_events, 4);
    assert_eq!(stats.exports_total, 2);
    assert_eq!(stats.exports_success, 2);
    assert_eq!(stats.exports_failed, 0);

    // Stop drains the export log; both dispatches are durably recorded
    pipeline.coordinator.stop().await;
    let logs = pipeline.store.export_logs().await;
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.success));
    assert!(logs.iter().all(|l| l.point_key == "7:supply_temp"));
}

#[tokio::test]
async fn test_batch_pipeline_flushes_on_stop() {
    let pipeline = pipeline_with_target(ExportMode::Batch {
        batch_size: 3,
        batch_timeout_ms: 60_000,
    })
    .await;

    for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
        publish(
            &pipeline.bus,
            "alarms:critical",
            &AlarmEvent::new(7, "supply_temp", value),
        );
    }
    settle().await;

    // One full batch of three dispatched; 4.0 and 5.0 still buffered
    assert_eq!(pipeline.payloads.lock().unwrap().len(), 1);

    // Stop flushes the partial buffer before shutting down
    pipeline.coordinator.stop().await;
    {
        let payloads = pipeline.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].as_array().unwrap().len(), 3);
        assert_eq!(payloads[1].as_array().unwrap().len(), 2);
    }

    let logs = pipeline.store.export_logs().await;
    assert_eq!(logs.len(), 2);
}

#[tokio::test]
async fn test_handler_failure_is_logged_not_fatal() {
    let pipeline = pipeline_with_target(ExportMode::OnChange {
        threshold: 0.0,
        force_first_send: true,
    })
    .await;

    // First dispatch fails, the next succeeds
    pipeline.fail.store(1, Ordering::SeqCst);
    publish(
        &pipeline.bus,
        "alarms:all",
        &AlarmEvent::new(7, "supply_temp", 1.0),
    );
    publish(
        &pipeline.bus,
        "alarms:all",
        &AlarmEvent::new(7, "supply_temp", 2.0),
    );
    settle().await;

    let stats = pipeline.coordinator.stats();
    assert_eq!(stats.exports_total, 2);
    assert_eq!(stats.exports_success, 1);
    assert_eq!(stats.exports_failed, 1);

    // Health reflects the failure without marking the target unhealthy
    let health = pipeline.coordinator.health_check().await;
    let target = &health["targets"][0];
    assert_eq!(target["attempts"], 2);
    assert_eq!(target["consecutive_failures"], 0);
    assert_eq!(target["healthy"], true);

    pipeline.coordinator.stop().await;
    let logs = pipeline.store.export_logs().await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs.iter().filter(|l| !l.success).count(), 1);
    assert_eq!(
        logs.iter()
            .find(|l| !l.success)
            .and_then(|l| l.error_message.as_deref()),
        Some("simulated outage")
    );
}

#[tokio::test]
async fn test_live_reload_over_system_channel() {
    let pipeline = pipeline_with_target(ExportMode::OnChange {
        threshold: 0.0,
        force_first_send: true,
    })
    .await;

    // Disable the only target in the store, then reload over the bus
    pipeline.store.set_targets(vec![]).await;
    pipeline
        .bus
        .publish("system:notify", br#"{"cmd":"reload-targets"}"#.to_vec());
    settle().await;

    publish(
        &pipeline.bus,
        "alarms:all",
        &AlarmEvent::new(7, "supply_temp", 1.0),
    );
    settle().await;

    // The event found no targets after the reload
    assert!(pipeline.payloads.lock().unwrap().is_empty());
    assert_eq!(pipeline.coordinator.stats().exports_total, 0);

    pipeline.coordinator.stop().await;
}
