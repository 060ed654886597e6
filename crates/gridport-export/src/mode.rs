//! Per-target export-mode decision engine
//!
//! Every target carries exactly one [`ExportMode`] policy deciding whether an
//! incoming value is forwarded, buffered, or dropped. The engine is
//! event-driven: decisions happen only inside [`process`](ExportModeEngine::process)
//! (or the manual [`force_send`](ExportModeEngine::force_send) /
//! [`flush_batch`](ExportModeEngine::flush_batch) calls), and every entry
//! point takes `now` explicitly so behavior is deterministic under test.
//!
//! Engines are per-target and not internally synchronized; the dispatch path
//! keeps them behind a per-target lock.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Export policy for one target, exactly one kind active at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportMode {
    /// Forward when the value moved more than `threshold` from the last
    /// forwarded value
    OnChange {
        #[serde(default)]
        threshold: f64,
        #[serde(default = "default_force_first_send")]
        force_first_send: bool,
    },
    /// Forward at most once per interval, last value wins
    Periodic { interval_ms: u64 },
    /// Collect values and forward full or timed-out batches
    Batch {
        batch_size: usize,
        batch_timeout_ms: u64,
    },
}

fn default_force_first_send() -> bool {
    true
}

impl Default for ExportMode {
    fn default() -> Self {
        Self::OnChange {
            threshold: 0.0,
            force_first_send: true,
        }
    }
}

impl ExportMode {
    /// Short policy name for logs and status output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OnChange { .. } => "on_change",
            Self::Periodic { .. } => "periodic",
            Self::Batch { .. } => "batch",
        }
    }
}

/// Outcome of one `process` call
#[derive(Debug, Clone, PartialEq)]
pub enum ModeDecision {
    /// Forward these values now (single element except for batch flushes)
    Send(Vec<f64>),
    /// Value retained for a later flush (periodic pending slot, batch buffer)
    Buffer,
    /// Value recorded but will never be forwarded
    Drop,
}

impl ModeDecision {
    /// True for `Send`
    pub fn is_send(&self) -> bool {
        matches!(self, Self::Send(_))
    }
}

/// Per-target decision state machine
#[derive(Debug)]
pub struct ExportModeEngine {
    mode: ExportMode,
    /// Last forwarded value (on_change baseline). The first value becomes
    /// the baseline even when it is not forwarded.
    last_sent_value: Option<f64>,
    /// Time of the last forward (periodic interval anchor)
    last_send_time: Option<Instant>,
    /// Most recent unsent value inside a periodic interval
    pending_value: Option<f64>,
    batch_buffer: Vec<f64>,
    batch_start: Option<Instant>,
    values_processed: u64,
    values_sent: u64,
}

impl ExportModeEngine {
    /// Create an engine in the unseen state
    pub fn new(mode: ExportMode) -> Self {
        Self {
            mode,
            last_sent_value: None,
            last_send_time: None,
            pending_value: None,
            batch_buffer: Vec::new(),
            batch_start: None,
            values_processed: 0,
            values_sent: 0,
        }
    }

    /// Current policy
    pub fn mode(&self) -> &ExportMode {
        &self.mode
    }

    /// Values handed to `process` since creation or last mode switch
    pub fn values_processed(&self) -> u64 {
        self.values_processed
    }

    /// Values forwarded (including forced sends and batch flushes)
    pub fn values_sent(&self) -> u64 {
        self.values_sent
    }

    /// Number of values currently buffered (batch mode)
    pub fn buffered(&self) -> usize {
        self.batch_buffer.len()
    }

    /// Decide what to do with one incoming value
    pub fn process(&mut self, value: f64, now: Instant) -> ModeDecision {
        self.values_processed += 1;

        match self.mode {
            ExportMode::OnChange {
                threshold,
                force_first_send,
            } => match self.last_sent_value {
                None => {
                    // First value arms the baseline whether or not it is sent
                    self.last_sent_value = Some(value);
                    if force_first_send {
                        self.mark_sent(1, now);
                        ModeDecision::Send(vec![value])
                    } else {
                        ModeDecision::Drop
                    }
                }
                Some(baseline) => {
                    if (value - baseline).abs() > threshold {
                        self.last_sent_value = Some(value);
                        self.mark_sent(1, now);
                        ModeDecision::Send(vec![value])
                    } else {
                        ModeDecision::Drop
                    }
                }
            },
            ExportMode::Periodic { interval_ms } => {
                let interval = Duration::from_millis(interval_ms);
                self.pending_value = Some(value);
                let due = match self.last_send_time {
                    None => true,
                    Some(t) => now.duration_since(t) >= interval,
                };
                if due {
                    self.pending_value = None;
                    self.last_sent_value = Some(value);
                    self.mark_sent(1, now);
                    ModeDecision::Send(vec![value])
                } else {
                    ModeDecision::Buffer
                }
            }
            ExportMode::Batch {
                batch_size,
                batch_timeout_ms,
            } => {
                if self.batch_buffer.is_empty() {
                    self.batch_start = Some(now);
                }
                self.batch_buffer.push(value);

                let full = batch_size > 0 && self.batch_buffer.len() >= batch_size;
                let timed_out = self
                    .batch_start
                    .map(|start| now.duration_since(start) >= Duration::from_millis(batch_timeout_ms))
                    .unwrap_or(false);

                if full || timed_out {
                    let drained = self.drain_batch(now);
                    ModeDecision::Send(drained)
                } else {
                    ModeDecision::Buffer
                }
            }
        }
    }

    /// Forward a value immediately, bypassing the policy.
    ///
    /// State still advances (baseline, interval anchor, counters) so
    /// subsequent `process` decisions stay consistent. In batch mode the
    /// pending buffer is drained with the value appended.
    pub fn force_send(&mut self, value: f64, now: Instant) -> Vec<f64> {
        match self.mode {
            ExportMode::Batch { .. } => {
                if self.batch_buffer.is_empty() {
                    self.batch_start = Some(now);
                }
                self.batch_buffer.push(value);
                self.drain_batch(now)
            }
            _ => {
                self.last_sent_value = Some(value);
                self.pending_value = None;
                self.mark_sent(1, now);
                vec![value]
            }
        }
    }

    /// Drain a pending partial batch regardless of size or timeout.
    ///
    /// Returns an empty vec when nothing is buffered (including for
    /// non-batch modes).
    pub fn flush_batch(&mut self, now: Instant) -> Vec<f64> {
        if self.batch_buffer.is_empty() {
            return Vec::new();
        }
        self.drain_batch(now)
    }

    /// Replace the policy, discarding all buffered and pending state.
    ///
    /// Undispatched data is dropped rather than flushed: a value the old
    /// policy was still holding was never admitted by the new one.
    pub fn set_mode(&mut self, mode: ExportMode) {
        self.mode = mode;
        self.last_sent_value = None;
        self.last_send_time = None;
        self.pending_value = None;
        self.batch_buffer.clear();
        self.batch_start = None;
        self.values_processed = 0;
        self.values_sent = 0;
    }

    fn drain_batch(&mut self, now: Instant) -> Vec<f64> {
        let drained = std::mem::take(&mut self.batch_buffer);
        self.batch_start = None;
        self.mark_sent(drained.len() as u64, now);
        drained
    }

    fn mark_sent(&mut self, count: u64, now: Instant) {
        self.values_sent += count;
        self.last_send_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_on_change_threshold_sequence() {
        // threshold=1.0, inputs [25.0, 25.5, 25.8, 27.0] -> sends {25.0, 27.0}
        let mut engine = ExportModeEngine::new(ExportMode::OnChange {
            threshold: 1.0,
            force_first_send: true,
        });
        let now = Instant::now();

        assert_eq!(engine.process(25.0, now), ModeDecision::Send(vec![25.0]));
        assert_eq!(engine.process(25.5, now), ModeDecision::Drop);
        assert_eq!(engine.process(25.8, now), ModeDecision::Drop);
        assert_eq!(engine.process(27.0, now), ModeDecision::Send(vec![27.0]));
        assert_eq!(engine.values_sent(), 2);
        assert_eq!(engine.values_processed(), 4);
    }

    #[test]
    fn test_on_change_baseline_moves_only_on_send() {
        // Creeping drift below the threshold must not ratchet the baseline.
        let mut engine = ExportModeEngine::new(ExportMode::OnChange {
            threshold: 1.0,
            force_first_send: true,
        });
        let now = Instant::now();

        engine.process(20.0, now);
        assert_eq!(engine.process(20.9, now), ModeDecision::Drop);
        assert_eq!(engine.process(21.05, now), ModeDecision::Send(vec![21.05]));
    }

    #[test]
    fn test_on_change_without_force_first_send() {
        let mut engine = ExportModeEngine::new(ExportMode::OnChange {
            threshold: 0.5,
            force_first_send: false,
        });
        let now = Instant::now();

        // First value only arms the baseline
        assert_eq!(engine.process(10.0, now), ModeDecision::Drop);
        assert_eq!(engine.process(10.2, now), ModeDecision::Drop);
        assert_eq!(engine.process(10.6, now), ModeDecision::Send(vec![10.6]));
    }

    #[test]
    fn test_periodic_interval_gating() {
        // interval=100ms, values at t=0,10,50,150 (25,26,27,28)
        // -> sends at t=0 (25) and t=150 (28)
        let mut engine = ExportModeEngine::new(ExportMode::Periodic { interval_ms: 100 });
        let base = Instant::now();

        assert_eq!(
            engine.process(25.0, at(base, 0)),
            ModeDecision::Send(vec![25.0])
        );
        assert_eq!(engine.process(26.0, at(base, 10)), ModeDecision::Buffer);
        assert_eq!(engine.process(27.0, at(base, 50)), ModeDecision::Buffer);
        assert_eq!(
            engine.process(28.0, at(base, 150)),
            ModeDecision::Send(vec![28.0])
        );
        assert_eq!(engine.values_sent(), 2);
    }

    #[test]
    fn test_periodic_boundary_is_inclusive() {
        let mut engine = ExportModeEngine::new(ExportMode::Periodic { interval_ms: 100 });
        let base = Instant::now();

        engine.process(1.0, at(base, 0));
        assert_eq!(
            engine.process(2.0, at(base, 100)),
            ModeDecision::Send(vec![2.0])
        );
    }

    #[test]
    fn test_periodic_interval_anchor_resets_on_send() {
        let mut engine = ExportModeEngine::new(ExportMode::Periodic { interval_ms: 100 });
        let base = Instant::now();

        engine.process(1.0, at(base, 0));
        engine.process(2.0, at(base, 150)); // sent, anchor now t=150
        assert_eq!(engine.process(3.0, at(base, 200)), ModeDecision::Buffer);
        assert_eq!(
            engine.process(4.0, at(base, 250)),
            ModeDecision::Send(vec![4.0])
        );
    }

    #[test]
    fn test_batch_full_flushes() {
        // size=5, 10 sequential inputs -> 2 flushes of 5, empty buffer after
        let mut engine = ExportModeEngine::new(ExportMode::Batch {
            batch_size: 5,
            batch_timeout_ms: 60_000,
        });
        let now = Instant::now();

        let mut flushes = Vec::new();
        for i in 0..10 {
            if let ModeDecision::Send(batch) = engine.process(i as f64, now) {
                flushes.push(batch);
            }
        }

        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0], vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(flushes[1], vec![5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(engine.values_sent(), 10);
    }

    #[test]
    fn test_batch_timeout_flushes_partial() {
        let mut engine = ExportModeEngine::new(ExportMode::Batch {
            batch_size: 100,
            batch_timeout_ms: 500,
        });
        let base = Instant::now();

        assert_eq!(engine.process(1.0, at(base, 0)), ModeDecision::Buffer);
        assert_eq!(engine.process(2.0, at(base, 100)), ModeDecision::Buffer);
        // Timeout measured from the batch's first item
        assert_eq!(
            engine.process(3.0, at(base, 500)),
            ModeDecision::Send(vec![1.0, 2.0, 3.0])
        );
        // Next value starts a fresh batch and timer
        assert_eq!(engine.process(4.0, at(base, 600)), ModeDecision::Buffer);
        assert_eq!(engine.buffered(), 1);
    }

    #[test]
    fn test_flush_batch_drains_partial() {
        let mut engine = ExportModeEngine::new(ExportMode::Batch {
            batch_size: 5,
            batch_timeout_ms: 60_000,
        });
        let now = Instant::now();

        engine.process(1.0, now);
        engine.process(2.0, now);
        assert_eq!(engine.flush_batch(now), vec![1.0, 2.0]);
        assert_eq!(engine.buffered(), 0);
        assert!(engine.flush_batch(now).is_empty());
    }

    #[test]
    fn test_force_send_updates_on_change_baseline() {
        let mut engine = ExportModeEngine::new(ExportMode::OnChange {
            threshold: 1.0,
            force_first_send: true,
        });
        let now = Instant::now();

        engine.process(10.0, now);
        assert_eq!(engine.force_send(10.1, now), vec![10.1]);
        // Baseline moved to 10.1, so 10.9 is inside the threshold again
        assert_eq!(engine.process(10.9, now), ModeDecision::Drop);
        assert_eq!(engine.process(11.2, now), ModeDecision::Send(vec![11.2]));
    }

    #[test]
    fn test_force_send_drains_batch() {
        let mut engine = ExportModeEngine::new(ExportMode::Batch {
            batch_size: 10,
            batch_timeout_ms: 60_000,
        });
        let now = Instant::now();

        engine.process(1.0, now);
        engine.process(2.0, now);
        assert_eq!(engine.force_send(3.0, now), vec![1.0, 2.0, 3.0]);
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_force_send_resets_periodic_anchor() {
        let mut engine = ExportModeEngine::new(ExportMode::Periodic { interval_ms: 100 });
        let base = Instant::now();

        engine.process(1.0, at(base, 0));
        engine.force_send(2.0, at(base, 50));
        // Anchor moved to t=50; t=120 is only 70ms later
        assert_eq!(engine.process(3.0, at(base, 120)), ModeDecision::Buffer);
        assert_eq!(
            engine.process(4.0, at(base, 150)),
            ModeDecision::Send(vec![4.0])
        );
    }

    #[test]
    fn test_mode_switch_discards_state() {
        let mut engine = ExportModeEngine::new(ExportMode::Batch {
            batch_size: 10,
            batch_timeout_ms: 60_000,
        });
        let now = Instant::now();

        engine.process(1.0, now);
        engine.process(2.0, now);
        assert_eq!(engine.buffered(), 2);

        engine.set_mode(ExportMode::OnChange {
            threshold: 1.0,
            force_first_send: true,
        });
        assert_eq!(engine.buffered(), 0);
        assert_eq!(engine.values_processed(), 0);
        // Engine is back in the unseen state
        assert_eq!(engine.process(5.0, now), ModeDecision::Send(vec![5.0]));
    }

    #[test]
    fn test_mode_serde_tagged_form() {
        let mode: ExportMode =
            serde_json::from_str(r#"{"kind":"batch","batch_size":20,"batch_timeout_ms":5000}"#)
                .unwrap();
        assert_eq!(
            mode,
            ExportMode::Batch {
                batch_size: 20,
                batch_timeout_ms: 5000
            }
        );
        assert_eq!(mode.kind(), "batch");

        let mode: ExportMode = serde_json::from_str(r#"{"kind":"on_change","threshold":0.5}"#).unwrap();
        assert_eq!(
            mode,
            ExportMode::OnChange {
                threshold: 0.5,
                force_first_send: true
            }
        );
    }
}
