// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/helmguard-rs

//! Log ingestion pipeline - batches log records between producers and disk

mod sink;

pub use sink::{JsonlSink, LogSink, NullSink};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::db::{LogRecord, RecordStore};

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub flushed_batches: u64,
    pub flushed_records: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_records: AtomicU64,
    failed_batches: AtomicU64,
}

/// Producer side of the log pipeline.
///
/// `enqueue` never blocks. A single background worker drains the channel in
/// batches of at most `batch_size`, or whatever arrived within
/// `flush_interval` of the first record of the batch, writes each batch to the
/// sink, then appends it to the recent-log cache.
pub struct LogPipeline {
    tx: mpsc::UnboundedSender<LogRecord>,
    recent: Arc<RecordStore<LogRecord>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl LogPipeline {
    /// Spawn the drain worker on the current runtime
    pub fn start(
        config: &PipelineConfig,
        sink: Arc<dyn LogSink>,
        recent: Arc<RecordStore<LogRecord>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            rx,
            sink,
            recent: recent.clone(),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            backoff: config.failure_backoff(),
            running: running.clone(),
            shutdown: shutdown.clone(),
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run());

        info!(
            "Log pipeline started (batch_size={}, flush_interval={:?})",
            config.batch_size, config.flush_interval()
        );

        Self {
            tx,
            recent,
            running,
            shutdown,
            worker: Mutex::new(Some(handle)),
            counters,
        }
    }

    /// Queue a record for the next batch
    pub fn enqueue(&self, record: LogRecord) {
        match self.tx.send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(record)) => {
                warn!("Log pipeline stopped, dropping log from {}", record.device_id);
            }
        }
    }

    /// Most recent flushed logs, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<LogRecord> {
        self.recent.get_recent(limit).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            flushed_batches: self.counters.flushed_batches.load(Ordering::Relaxed),
            flushed_records: self.counters.flushed_records.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker after one final pass over everything already queued
    pub async fn drain_and_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Log pipeline worker panicked: {}", e);
            }
        }
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<LogRecord>,
    sink: Arc<dyn LogSink>,
    recent: Arc<RecordStore<LogRecord>>,
    batch_size: usize,
    flush_interval: Duration,
    backoff: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self) {
        // Survives a cancelled collection so nothing pulled off the channel is lost
        let mut batch = Vec::with_capacity(self.batch_size);

        while self.running.load(Ordering::SeqCst) {
            let open = tokio::select! {
                open = collect_batch(&mut self.rx, &mut batch, self.batch_size, self.flush_interval) => open,
                _ = self.shutdown.notified() => break,
            };

            if !batch.is_empty() {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                self.flush(full, true).await;
            }

            if !open {
                debug!("Log channel closed");
                break;
            }
        }

        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        let remaining = batch.len();
        for chunk in batch.chunks(self.batch_size) {
            self.flush(chunk.to_vec(), false).await;
        }

        info!("Log pipeline stopped ({} records in final drain)", remaining);
    }

    async fn flush(&self, batch: Vec<LogRecord>, backoff: bool) {
        let count = batch.len();
        let result = self.sink.write_batch(&batch).await;

        // Records stay visible in the cache even when the journal write failed
        self.recent.extend(batch).await;

        match result {
            Ok(()) => {
                self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.flushed_records.fetch_add(count as u64, Ordering::Relaxed);
                debug!("Flushed {} log records", count);
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist batch of {} logs: {}", count, e);
                if backoff {
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

/// Fill `batch` until it holds `batch_size` records or `interval` has passed
/// since its first record arrived.
///
/// An idle wait of `interval` returns with `batch` empty. Returns false once
/// the channel is closed.
async fn collect_batch(
    rx: &mut mpsc::UnboundedReceiver<LogRecord>,
    batch: &mut Vec<LogRecord>,
    batch_size: usize,
    interval: Duration,
) -> bool {
    if batch.is_empty() {
        match timeout(interval, rx.recv()).await {
            Ok(Some(record)) => batch.push(record),
            Ok(None) => return false,
            Err(_) => return true,
        }
    }

    let deadline = Instant::now() + interval;
    while batch.len() < batch_size {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(record)) => batch.push(record),
            Ok(None) => return false,
            Err(_) => break,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LogLevel, RecordCategory};
    use crate::error::StoreError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingSink {
        batches: parking_lot::Mutex<Vec<(Instant, Vec<LogRecord>)>>,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<LogRecord>> {
            self.batches.lock().iter().map(|(_, b)| b.clone()).collect()
        }

        async fn wait_for(&self, count: usize) {
            for _ in 0..1000 {
                if self.batches.lock().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {count} batches");
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StoreError> {
            self.batches.lock().push((Instant::now(), batch.to_vec()));
            Ok(())
        }
    }

    /// Fails the first write, succeeds afterwards
    #[derive(Default)]
    struct FlakySink {
        calls: AtomicU64,
    }

    #[async_trait]
    impl LogSink for FlakySink {
        async fn write_batch(&self, _batch: &[LogRecord]) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::io(
                    "logs.jsonl",
                    std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                ));
            }
            Ok(())
        }
    }

    fn config(batch_size: usize, flush_interval_ms: u64) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            flush_interval_ms,
            failure_backoff_ms: 100,
            ..PipelineConfig::default()
        }
    }

    fn recent_cache() -> Arc<RecordStore<LogRecord>> {
        Arc::new(RecordStore::in_memory(RecordCategory::Log, 1000))
    }

    fn log(n: usize) -> LogRecord {
        LogRecord::new("helmet-001", LogLevel::Info, format!("m{n}"), Some(n.to_string()), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_within_interval() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = LogPipeline::start(&config(10, 500), sink.clone(), recent_cache());

        let first_enqueue = Instant::now();
        for n in 0..3 {
            pipeline.enqueue(log(n));
        }
        sink.wait_for(1).await;

        let batches = sink.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        let (flushed_at, batch) = &batches[0];
        // timers resolve to whole milliseconds
        assert!(flushed_at.duration_since(first_enqueue) <= Duration::from_millis(501));
        let messages: Vec<_> = batch.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["m0", "m1", "m2"]);

        pipeline.drain_and_stop().await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batches_flush_before_interval() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = LogPipeline::start(&config(3, 5_000), sink.clone(), recent_cache());

        let start = Instant::now();
        for n in 0..7 {
            pipeline.enqueue(log(n));
        }
        sink.wait_for(2).await;

        let batches = sink.batches.lock().clone();
        assert!(batches.iter().all(|(at, _)| at.duration_since(start) < Duration::from_secs(1)));
        assert_eq!(batches[0].1.len(), 3);
        assert_eq!(batches[1].1.len(), 3);

        // the straggler waits for its interval
        sink.wait_for(3).await;
        let sizes: Vec<_> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        pipeline.drain_and_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pipeline_does_not_flush() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = LogPipeline::start(&config(10, 100), sink.clone(), recent_cache());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.batches().is_empty());

        pipeline.drain_and_stop().await;
        assert!(sink.batches().is_empty());
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_drain_and_stop_flushes_buffered_records() {
        let sink = Arc::new(RecordingSink::default());
        let recent = recent_cache();
        let pipeline = LogPipeline::start(&config(10, 3_600_000), sink.clone(), recent.clone());

        for n in 0..4 {
            pipeline.enqueue(log(n));
        }
        pipeline.drain_and_stop().await;

        let flushed: Vec<_> = sink.batches().concat();
        assert_eq!(flushed.len(), 4);
        assert_eq!(flushed[0].message, "m0");
        assert_eq!(flushed[3].message, "m3");
        assert_eq!(recent.len().await, 4);

        let stats = pipeline.stats();
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.flushed_records, 4);
    }

    #[tokio::test]
    async fn test_recent_cache_keeps_last_thousand() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = LogPipeline::start(&config(100, 3_600_000), sink, recent_cache());

        for n in 0..1500 {
            pipeline.enqueue(log(n));
        }
        pipeline.drain_and_stop().await;

        let recent = pipeline.recent(1500).await;
        assert_eq!(recent.len(), 1000);
        assert_eq!(recent[0].message, "m500");
        assert_eq!(recent[999].message, "m1499");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_is_reported_and_worker_continues() {
        let sink = Arc::new(FlakySink::default());
        let recent = recent_cache();
        let pipeline = LogPipeline::start(&config(2, 50), sink.clone(), recent.clone());

        pipeline.enqueue(log(0));
        pipeline.enqueue(log(1));
        tokio::time::sleep(Duration::from_millis(500)).await;

        pipeline.enqueue(log(2));
        pipeline.enqueue(log(3));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = pipeline.stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.flushed_batches, 1);
        assert_eq!(stats.flushed_records, 2);
        assert_eq!(recent.len().await, 4);

        pipeline.drain_and_stop().await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}
