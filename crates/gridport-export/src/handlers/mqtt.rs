//! MQTT target handler
//!
//! Publishes rendered payloads through [rumqttc], a pure Rust MQTT client.
//! Each dispatch opens a short-lived connection, publishes to an
//! interpolated topic, and waits for the broker acknowledgement matching
//! the configured QoS, all bounded by the publish timeout — a hung broker
//! can never hang the dispatch path.

use super::{HandlerFactory, TargetHandler};
use crate::error::{HandlerError, HandlerResult};
use crate::event::{AlarmEvent, ExportResult};
use crate::store::TargetRecord;
use crate::types::SensitiveString;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use validator::Validate;

/// MQTT handler configuration (per-target config blob)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MqttHandlerConfig {
    /// Broker URL: `mqtt://host:1883` or `mqtts://host:8883`
    #[validate(length(min = 1))]
    pub broker_url: String,

    /// Topic, supports `{building_id}` and `{point_name}` placeholders
    #[validate(length(min = 1))]
    pub topic: String,

    /// Client id prefix; a random suffix is appended per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Quality of service: 0, 1, or 2 (default: 1)
    #[serde(default = "default_qos")]
    #[validate(range(max = 2))]
    pub qos: u8,

    /// Publish with the retain flag
    #[serde(default)]
    pub retain: bool,

    /// Broker username (optional)
    #[serde(default)]
    pub username: Option<String>,

    /// Broker password (optional)
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Publish timeout in seconds, covering connect + ack (default: 10)
    #[serde(default = "default_publish_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub publish_timeout_secs: u32,

    /// Keep-alive interval in seconds (default: 30)
    #[serde(default = "default_keep_alive_secs")]
    #[validate(range(min = 5, max = 300))]
    pub keep_alive_secs: u32,
}

fn default_client_id() -> String {
    "gridport-export".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_publish_timeout_secs() -> u32 {
    10
}

fn default_keep_alive_secs() -> u32 {
    30
}

/// Broker endpoint parsed out of `broker_url`
#[derive(Debug, Clone, PartialEq, Eq)]
struct BrokerEndpoint {
    host: String,
    port: u16,
    tls: bool,
}

fn parse_broker_url(raw: &str) -> HandlerResult<BrokerEndpoint> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| HandlerError::config(format!("invalid broker_url '{}': {}", raw, e)))?;

    let tls = match parsed.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        scheme => {
            return Err(HandlerError::config(format!(
                "broker_url scheme must be mqtt/mqtts, got '{}'",
                scheme
            )))
        }
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| HandlerError::config(format!("broker_url '{}' has no host", raw)))?
        .to_string();
    let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}

fn interpolate_topic(topic: &str, event: &AlarmEvent) -> String {
    topic
        .replace("{building_id}", &event.building_id.to_string())
        .replace("{point_name}", &event.point_name)
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Handler instance bound to one target
pub struct MqttTargetHandler {
    target_id: i64,
    target_name: String,
    config: MqttHandlerConfig,
    endpoint: BrokerEndpoint,
}

impl MqttTargetHandler {
    fn options(&self) -> MqttOptions {
        let client_id = format!(
            "{}-{}",
            self.config.client_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut options = MqttOptions::new(client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs as u64));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.expose().to_string());
        }
        if self.endpoint.tls {
            options.set_transport(rumqttc::Transport::Tls(Default::default()));
        }
        options
    }

    /// Publish and wait for the ack matching the configured QoS
    async fn publish(&self, topic: &str, body: Vec<u8>) -> HandlerResult<()> {
        let qos = to_qos(self.config.qos);
        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);

        client
            .publish(topic, qos, self.config.retain, body)
            .await
            .map_err(|e| HandlerError::connection(format!("publish enqueue failed: {}", e)))?;

        let deadline = Duration::from_secs(self.config.publish_timeout_secs as u64);
        let started = Instant::now();

        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| HandlerError::timeout("publish ack not received"))?;

            let event = tokio::time::timeout(remaining, eventloop.poll())
                .await
                .map_err(|_| HandlerError::timeout("publish ack not received"))?
                .map_err(|e| HandlerError::connection(format!("broker connection: {}", e)))?;

            match (&event, qos) {
                (Event::Outgoing(Outgoing::Publish(_)), QoS::AtMostOnce) => break,
                (Event::Incoming(Packet::PubAck(_)), QoS::AtLeastOnce) => break,
                (Event::Incoming(Packet::PubComp(_)), QoS::ExactlyOnce) => break,
                _ => continue,
            }
        }

        // Best-effort clean disconnect; delivery is already confirmed
        let _ = client.disconnect().await;
        Ok(())
    }
}

#[async_trait]
impl TargetHandler for MqttTargetHandler {
    async fn check(&self) -> HandlerResult<()> {
        let (_client, mut eventloop) = AsyncClient::new(self.options(), 10);
        let deadline = Duration::from_secs(self.config.publish_timeout_secs as u64);

        let event = tokio::time::timeout(deadline, eventloop.poll())
            .await
            .map_err(|_| HandlerError::timeout("broker did not answer CONNECT"))?
            .map_err(|e| HandlerError::connection(format!("broker connection: {}", e)))?;

        match event {
            Event::Incoming(Packet::ConnAck(ack))
                if ack.code == rumqttc::ConnectReturnCode::Success =>
            {
                Ok(())
            }
            Event::Incoming(Packet::ConnAck(ack)) => Err(HandlerError::Auth(format!(
                "broker rejected connection: {:?}",
                ack.code
            ))),
            other => Err(HandlerError::connection(format!(
                "unexpected broker response: {:?}",
                other
            ))),
        }
    }

    async fn send(&self, event: &AlarmEvent, payload: &Value) -> ExportResult {
        let started = Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return ExportResult::failure(
                    self.target_id,
                    &self.target_name,
                    format!("payload serialization failed: {}", e),
                )
                .with_processing_time(started.elapsed());
            }
        };
        let data_size = body.len();
        let topic = interpolate_topic(&self.config.topic, event);

        match self.publish(&topic, body).await {
            Ok(()) => {
                debug!(
                    "MQTT target '{}' published {} bytes to '{}'",
                    self.target_name, data_size, topic
                );
                ExportResult::ok(self.target_id, &self.target_name)
                    .with_processing_time(started.elapsed())
                    .with_data_size(data_size)
            }
            Err(e) => ExportResult::failure(self.target_id, &self.target_name, e.to_string())
                .with_processing_time(started.elapsed())
                .with_data_size(data_size),
        }
    }
}

/// Factory for the `mqtt` target type
pub struct MqttHandlerFactory;

impl HandlerFactory for MqttHandlerFactory {
    fn type_name(&self) -> &'static str {
        "mqtt"
    }

    fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>> {
        let config: MqttHandlerConfig = serde_json::from_value(target.config.clone())
            .map_err(|e| HandlerError::config(format!("invalid mqtt config: {}", e)))?;
        config
            .validate()
            .map_err(|e| HandlerError::config(format!("invalid mqtt config: {}", e)))?;

        let endpoint = parse_broker_url(&config.broker_url)?;
        Ok(Arc::new(MqttTargetHandler {
            target_id: target.id,
            target_name: target.name.clone(),
            config,
            endpoint,
        }))
    }
}
