//! Asynchronous export-log persistence
//!
//! Every dispatch attempt produces an [`ExportLogEntry`]. The hot dispatch
//! path must never block or fail because of logging, so entries go through
//! a hard-capacity-bounded queue: [`enqueue`](ExportLogService::enqueue) is
//! a non-blocking `try_send`, and overflow drops the entry and bumps a
//! counted, rate-limit-logged drop metric. A single consumer task pops up
//! to a batch size with a flush timeout, persists batches through the
//! store, and drains the queue before exiting on shutdown.

use crate::event::ExportLogEntry;
use crate::store::ConfigStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tuning for the log queue and its consumer
#[derive(Debug, Clone)]
pub struct ExportLogConfig {
    /// Hard queue capacity; enqueues beyond this are dropped
    pub queue_capacity: usize,
    /// Maximum entries per persisted batch
    pub batch_size: usize,
    /// How long a partial batch waits for more entries
    pub flush_interval: Duration,
    /// Log every Nth dropped entry (the first drop always logs)
    pub drop_log_every: u64,
}

impl Default for ExportLogConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_millis(1000),
            drop_log_every: 1000,
        }
    }
}

/// Lock-free counters exposed through `stats()`
#[derive(Debug, Default)]
pub struct ExportLogStats {
    pub enqueued: AtomicU64,
    pub persisted: AtomicU64,
    pub dropped: AtomicU64,
    pub persist_failures: AtomicU64,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportLogStatsSnapshot {
    pub enqueued: u64,
    pub persisted: u64,
    pub dropped: u64,
    pub persist_failures: u64,
}

/// Bounded-queue, batched log persistence service
pub struct ExportLogService {
    tx: mpsc::Sender<ExportLogEntry>,
    rx: Mutex<Option<mpsc::Receiver<ExportLogEntry>>>,
    store: Arc<dyn ConfigStore>,
    config: ExportLogConfig,
    stats: Arc<ExportLogStats>,
    shutdown_tx: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ExportLogService {
    /// Create the service with its queue; the consumer is not running
    /// until [`start`](Self::start) is called.
    pub fn new(store: Arc<dyn ConfigStore>, config: ExportLogConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            store,
            config,
            stats: Arc::new(ExportLogStats::default()),
            shutdown_tx,
            consumer: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. Overflow drops the entry and counts it —
    /// the caller never waits and never sees an error.
    pub fn enqueue(&self, entry: ExportLogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % self.config.drop_log_every == 0 {
                    warn!(
                        "Export log queue full, {} entries dropped so far",
                        dropped
                    );
                }
            }
        }
    }

    /// Start the consumer task. Calling again while running is a no-op.
    pub fn start(&self) {
        let mut consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if consumer.is_some() {
            return;
        }

        let rx = match self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            Some(rx) => rx,
            None => return, // already consumed by a previous run
        };

        let store = self.store.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        *consumer = Some(tokio::spawn(consume_loop(
            rx, store, stats, config, shutdown_rx,
        )));
    }

    /// Signal shutdown and wait for the consumer to drain and exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Export log consumer task panicked: {}", e);
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> ExportLogStatsSnapshot {
        ExportLogStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Entries currently waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.config.queue_capacity - self.tx.capacity()
    }
}

async fn consume_loop(
    mut rx: mpsc::Receiver<ExportLogEntry>,
    store: Arc<dyn ConfigStore>,
    stats: Arc<ExportLogStats>,
    config: ExportLogConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(
        "Export log consumer started (batch_size={}, flush_interval={:?})",
        config.batch_size, config.flush_interval
    );
    let mut batch: Vec<ExportLogEntry> = Vec::with_capacity(config.batch_size);

    'running: loop {
        // Wait for the first entry of a batch, or shutdown
        let first = tokio::select! {
            _ = shutdown_rx.changed() => break 'running,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break 'running,
            },
        };
        batch.push(first);

        // Fill the batch until full or the flush interval elapses
        let deadline = tokio::time::Instant::now() + config.flush_interval;
        while batch.len() < config.batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                entry = tokio::time::timeout(remaining, rx.recv()) => match entry {
                    Ok(Some(entry)) => batch.push(entry),
                    Ok(None) => break,
                    Err(_) => break, // flush timeout
                },
            }
        }

        persist_batch(&store, &stats, &mut batch).await;

        if *shutdown_rx.borrow() {
            break 'running;
        }
    }

    // Graceful drain: everything still queued gets persisted before exit
    loop {
        match rx.try_recv() {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= config.batch_size {
                    persist_batch(&store, &stats, &mut batch).await;
                }
            }
            Err(_) => break,
        }
    }
    persist_batch(&store, &stats, &mut batch).await;

    info!(
        "Export log consumer stopped ({} persisted, {} dropped)",
        stats.persisted.load(Ordering::Relaxed),
        stats.dropped.load(Ordering::Relaxed)
    );
}

async fn persist_batch(
    store: &Arc<dyn ConfigStore>,
    stats: &Arc<ExportLogStats>,
    batch: &mut Vec<ExportLogEntry>,
) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;
    match store.save_export_logs(std::mem::take(batch)).await {
        Ok(()) => {
            stats.persisted.fetch_add(count, Ordering::Relaxed);
        }
        Err(e) => {
            // Persistence failure is counted, never propagated upward
            stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!("Failed to persist {} export log entries: {}", count, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ExportResult;
    use crate::store::MemoryStore;

    fn entry(n: i64) -> ExportLogEntry {
        let result = ExportResult::ok(n, format!("target-{}", n));
        ExportLogEntry::from_result(&result, "1:p", 1.0, 1.0, "{}", "gw-test")
    }

    fn service(capacity: usize) -> (Arc<MemoryStore>, ExportLogService) {
        let store = Arc::new(MemoryStore::new());
        let config = ExportLogConfig {
            queue_capacity: capacity,
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            drop_log_every: 100,
        };
        (store.clone(), ExportLogService::new(store, config))
    }

    #[tokio::test]
    async fn test_overflow_drops_without_blocking() {
        // Consumer never started: the queue fills, the excess drops
        let (_store, service) = service(5);

        for n in 0..8 {
            service.enqueue(entry(n));
        }

        let stats = service.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.dropped, 3);
        assert_eq!(service.queue_depth(), 5);
    }

    #[tokio::test]
    async fn test_consumer_persists_batches() {
        let (store, service) = service(100);
        service.start();

        for n in 0..25 {
            service.enqueue(entry(n));
        }

        // Flush interval is 20ms; give the consumer a few cycles
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = service.stats();
        assert_eq!(stats.persisted, 25);
        assert_eq!(stats.persist_failures, 0);
        assert_eq!(store.export_logs().await.len(), 25);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (store, service) = service(100);

        // Enqueue while the consumer is not yet running
        for n in 0..30 {
            service.enqueue(entry(n));
        }
        service.start();
        service.shutdown().await;

        assert_eq!(store.export_logs().await.len(), 30);
        assert_eq!(service.stats().persisted, 30);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (store, service) = service(100);
        service.start();
        service.start();
        service.enqueue(entry(1));
        service.shutdown().await;
        assert_eq!(store.export_logs().await.len(), 1);
    }
}
