//! Health tracking and probe endpoint
//!
//! Per-target dispatch health (rolling success rate over the last N
//! attempts, consecutive-failure count) plus a minimal HTTP endpoint for
//! liveness and readiness probes. The endpoint speaks just enough HTTP for
//! probes; it is not a general web server.

use crate::config::HealthSettings;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A target is reported unhealthy after this many consecutive failures
pub const UNHEALTHY_AFTER: u64 = 5;

/// Rolling dispatch health for one target
#[derive(Debug, Clone)]
pub struct TargetHealth {
    pub target_name: String,
    window: VecDeque<bool>,
    window_size: usize,
    pub attempts: u64,
    pub successes: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
}

impl TargetHealth {
    fn new(target_name: String, window_size: usize) -> Self {
        Self {
            target_name,
            window: VecDeque::with_capacity(window_size),
            window_size,
            attempts: 0,
            successes: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    fn record(&mut self, success: bool, error: Option<&str>) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);

        self.attempts += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.last_error = error.map(str::to_string);
        }
    }

    /// Success rate over the rolling window; `1.0` before any attempt
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|&&s| s).count();
        ok as f64 / self.window.len() as f64
    }

    /// Healthy until the consecutive-failure threshold is reached
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_AFTER
    }
}

/// Aggregate health of the export engine
#[derive(Debug)]
pub struct HealthState {
    window_size: usize,
    targets: HashMap<i64, TargetHealth>,
    pub bus_connected: bool,
    pub started_at: Option<std::time::Instant>,
}

impl HealthState {
    /// Create with the configured rolling-window size
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            targets: HashMap::new(),
            bus_connected: false,
            started_at: None,
        }
    }

    /// Record one dispatch outcome for a target
    pub fn record_dispatch(
        &mut self,
        target_id: i64,
        target_name: &str,
        success: bool,
        error: Option<&str>,
    ) {
        self.targets
            .entry(target_id)
            .or_insert_with(|| TargetHealth::new(target_name.to_string(), self.window_size))
            .record(success, error);
    }

    /// Per-target health views
    pub fn targets(&self) -> &HashMap<i64, TargetHealth> {
        &self.targets
    }

    /// Drop health entries for targets no longer in the registry
    pub fn retain_targets(&mut self, live: &dyn Fn(i64) -> bool) {
        self.targets.retain(|id, _| live(*id));
    }

    /// Healthy: bus connected and no target past the failure threshold
    pub fn is_healthy(&self) -> bool {
        self.bus_connected && self.targets.values().all(TargetHealth::is_healthy)
    }

    /// Ready: bus connected (targets may still be warming up)
    pub fn is_ready(&self) -> bool {
        self.bus_connected
    }

    /// JSON document served by the health endpoint
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_healthy() { "healthy" } else { "unhealthy" },
            "bus_connected": self.bus_connected,
            "uptime_secs": self.started_at.map(|t| t.elapsed().as_secs()),
            "targets": self.targets.iter().map(|(id, h)| {
                serde_json::json!({
                    "id": id,
                    "name": h.target_name,
                    "attempts": h.attempts,
                    "successes": h.successes,
                    "success_rate": h.success_rate(),
                    "consecutive_failures": h.consecutive_failures,
                    "healthy": h.is_healthy(),
                    "last_error": h.last_error,
                })
            }).collect::<Vec<_>>(),
        })
    }
}

/// Shared health state
pub type SharedHealthState = Arc<RwLock<HealthState>>;

/// Start the probe endpoint; returns once the listener fails or never
pub async fn start_health_server(
    settings: HealthSettings,
    state: SharedHealthState,
) -> std::io::Result<()> {
    if !settings.enabled {
        debug!("Health endpoint disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on http://{}{}", addr, settings.path);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let state = state.clone();
        let path = settings.path.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            match socket.read(&mut buf).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let Some(first_line) = request.lines().next() else {
                        return;
                    };
                    let parts: Vec<&str> = first_line.split_whitespace().collect();
                    if parts.len() < 2 {
                        return;
                    }
                    debug!("Health request {} {} from {}", parts[0], parts[1], peer);

                    let response = match (parts[0], parts[1]) {
                        ("GET", p) if p == path => {
                            let state = state.read().await;
                            let code = if state.is_healthy() { 200 } else { 503 };
                            http_response(code, &state.to_json())
                        }
                        ("GET", "/ready") => {
                            let state = state.read().await;
                            let ready = state.is_ready();
                            http_response(
                                if ready { 200 } else { 503 },
                                &serde_json::json!({"ready": ready}),
                            )
                        }
                        ("GET", "/live") => http_response(200, &serde_json::json!({"alive": true})),
                        _ => "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nNot Found".to_string(),
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        warn!("Failed to write health response: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Health socket error: {}", e),
            }
        });
    }
}

fn http_response(code: u16, body: &serde_json::Value) -> String {
    let reason = if code == 200 { "OK" } else { "Service Unavailable" };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        serde_json::to_string_pretty(body).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_success_rate() {
        let mut health = TargetHealth::new("t".into(), 4);
        assert_eq!(health.success_rate(), 1.0);

        health.record(true, None);
        health.record(true, None);
        health.record(false, Some("timeout"));
        assert!((health.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        // Window slides: oldest success falls out
        health.record(false, Some("timeout"));
        health.record(false, Some("timeout"));
        assert_eq!(health.success_rate(), 0.25);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let mut health = TargetHealth::new("t".into(), 8);
        for _ in 0..4 {
            health.record(false, Some("down"));
        }
        assert!(health.is_healthy());
        health.record(false, Some("down"));
        assert!(!health.is_healthy());

        health.record(true, None);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_health_state_aggregation() {
        let mut state = HealthState::new(16);
        state.bus_connected = true;
        assert!(state.is_healthy());
        assert!(state.is_ready());

        state.record_dispatch(1, "good", true, None);
        for _ in 0..UNHEALTHY_AFTER {
            state.record_dispatch(2, "bad", false, Some("refused"));
        }
        assert!(!state.is_healthy());
        assert!(state.is_ready());

        state.bus_connected = false;
        assert!(!state.is_ready());
    }

    #[test]
    fn test_retain_targets_drops_stale() {
        let mut state = HealthState::new(16);
        state.record_dispatch(1, "keep", true, None);
        state.record_dispatch(2, "drop", true, None);
        state.retain_targets(&|id| id == 1);
        assert_eq!(state.targets().len(), 1);
        assert!(state.targets().contains_key(&1));
    }

    #[test]
    fn test_json_shape() {
        let mut state = HealthState::new(16);
        state.bus_connected = true;
        state.record_dispatch(1, "t", true, None);
        let json = state.to_json();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["targets"][0]["name"], "t");
        assert_eq!(json["targets"][0]["success_rate"], 1.0);
    }
}
