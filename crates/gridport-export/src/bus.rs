//! Pub/sub ingress seam
//!
//! The upstream collectors publish events on a pub/sub bus; the engine
//! consumes them through the [`MessageBus`] trait so the subscriber logic
//! is independent of the broker. [`RedisBus`] is the production
//! implementation (pattern channels via PSUBSCRIBE); [`MemoryBus`] backs
//! tests and embedded single-process deployments.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

/// One raw message off the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Construct a message, serializing nothing — payload is raw bytes
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Subscribe-side bus handle
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to a set of channel patterns and return the merged
    /// message stream. Patterns ending in `*` match by prefix
    /// (`alarms:*` matches `alarms:critical`); others match exactly.
    async fn subscribe(&self, patterns: &[String]) -> Result<BoxStream<'static, BusMessage>>;
}

/// Check one channel name against one pattern
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn matches_any(patterns: &[String], channel: &str) -> bool {
    patterns.iter().any(|p| channel_matches(p, channel))
}

/// In-process bus over a tokio broadcast channel
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    /// Create a bus retaining up to `capacity` undelivered messages
    /// per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a message; returns the number of live subscribers
    pub fn publish(&self, channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> usize {
        self.tx
            .send(BusMessage::new(channel, payload))
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, patterns: &[String]) -> Result<BoxStream<'static, BusMessage>> {
        let rx = self.tx.subscribe();
        let patterns = patterns.to_vec();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    // A lagged subscriber skips overwritten messages and
                    // keeps going; at-least-once is not a bus property here
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg: &BusMessage| {
            futures::future::ready(matches_any(&patterns, &msg.channel))
        })
        .boxed();

        Ok(stream)
    }
}

/// Redis pub/sub bus
#[cfg(feature = "redis-bus")]
pub struct RedisBus {
    client: redis::Client,
}

#[cfg(feature = "redis-bus")]
impl RedisBus {
    /// Create a bus for the given redis URL (`redis://host:6379/0`)
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| crate::error::ExportError::bus(format!("invalid redis url: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "redis-bus")]
#[async_trait]
impl MessageBus for RedisBus {
    async fn subscribe(&self, patterns: &[String]) -> Result<BoxStream<'static, BusMessage>> {
        use crate::error::ExportError;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ExportError::bus(format!("redis connect: {}", e)))?;

        for pattern in patterns {
            if pattern.contains('*') {
                pubsub
                    .psubscribe(pattern)
                    .await
                    .map_err(|e| ExportError::bus(format!("psubscribe '{}': {}", pattern, e)))?;
            } else {
                pubsub
                    .subscribe(pattern)
                    .await
                    .map_err(|e| ExportError::bus(format!("subscribe '{}': {}", pattern, e)))?;
            }
        }

        let stream = pubsub
            .into_on_message()
            .map(|msg| BusMessage {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            })
            .boxed();

        Ok(stream)
    }
}
