//! Batch persistence with two-level backpressure.
//!
//! A counting permit pool bounds rows admitted but not yet flushed; a
//! bounded staging queue holds them until a periodic flush drains up to
//! `batch_size` rows into one bulk write. Rejection, not blocking, is the
//! load-shedding signal to callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::db::ProcessedMessageStore;
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::models::ProcessedMessage;

/// Shutdown drain aborts after this many flushes in a row make no progress
/// (durable store down and every batch re-enqueued).
const MAX_STALLED_DRAIN_FLUSHES: u32 = 3;

pub struct BatchPersistService {
    store: Arc<dyn ProcessedMessageStore>,
    queue_tx: mpsc::Sender<ProcessedMessage>,
    queue_rx: Mutex<mpsc::Receiver<ProcessedMessage>>,
    permits: Arc<Semaphore>,
    config: PersistenceConfig,
    metrics: Arc<PipelineMetrics>,
}

impl BatchPersistService {
    pub fn new(
        store: Arc<dyn ProcessedMessageStore>,
        config: PersistenceConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        info!(
            buffer_capacity = config.buffer_capacity,
            batch_size = config.batch_size,
            max_permits = config.max_concurrent_permits,
            flush_interval_ms = config.flush_interval_ms,
            "BatchPersistService initialized"
        );

        let (queue_tx, queue_rx) = mpsc::channel(config.buffer_capacity);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_permits));
        metrics
            .persist_permits_available
            .set(config.max_concurrent_permits as i64);

        Self {
            store,
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            permits,
            config,
            metrics,
        }
    }

    /// Enqueue an audit row for the next flush.
    ///
    /// Returns `false` when backpressure rejects the row; the row is then
    /// not persisted and the caller owns that outcome.
    pub async fn enqueue(&self, record: ProcessedMessage) -> bool {
        let message_id = record.message_id.clone();

        // First level: the permit pool bounds total in-flight rows.
        let permit = match timeout(
            Duration::from_millis(self.config.permit_timeout_ms),
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                warn!(message_id = %message_id, "persistence pipeline is shut down, rejecting");
                self.metrics.backpressure_rejections.inc();
                return false;
            }
            Err(_elapsed) => {
                warn!(message_id = %message_id, "backpressure: permit pool exhausted");
                self.metrics.backpressure_rejections.inc();
                return false;
            }
        };
        // Released explicitly by the flush that drains this row.
        permit.forget();
        self.update_gauges();

        // Second level: the bounded queue caps staged memory.
        match self
            .queue_tx
            .send_timeout(record, Duration::from_millis(self.config.offer_timeout_ms))
            .await
        {
            Ok(()) => {
                self.update_gauges();
                true
            }
            Err(_) => {
                self.permits.add_permits(1);
                warn!(message_id = %message_id, "backpressure: staging queue full");
                self.metrics.backpressure_rejections.inc();
                self.update_gauges();
                false
            }
        }
    }

    /// Drain up to `batch_size` staged rows and bulk-write them.
    ///
    /// Permits for the drained rows are released whatever the write
    /// outcome, so a durable-store outage cannot starve the pool. Returns
    /// the number of rows drained.
    pub async fn flush_once(&self) -> usize {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        {
            let mut rx = self.queue_rx.lock().await;
            while batch.len() < self.config.batch_size {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
        }

        if batch.is_empty() {
            return 0;
        }
        let drained = batch.len();

        let started = Instant::now();
        let write_result = self.store.save_all(&batch).await;
        self.metrics
            .batch_flush_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match write_result {
            Ok(()) => {
                self.metrics.batch_persist_success.inc_by(drained as u64);
                debug!(drained, "batch persisted to durable store");
            }
            Err(e) => {
                self.metrics.batch_persist_errors.inc_by(drained as u64);
                error!(drained, "Error persisting batch, re-enqueuing: {}", e);

                // Best-effort re-enqueue; rows that no longer fit are dropped.
                for record in batch {
                    if let Err(
                        TrySendError::Full(record) | TrySendError::Closed(record),
                    ) = self.queue_tx.try_send(record)
                    {
                        error!(
                            message_id = %record.message_id,
                            "Could not re-enqueue audit row after batch failure, dropping"
                        );
                    }
                }
            }
        }

        self.permits.add_permits(drained);
        self.update_gauges();
        drained
    }

    /// Flush repeatedly until the staging queue is empty.
    ///
    /// Best-effort: if the durable store keeps failing and the queue stops
    /// shrinking, the drain gives up instead of spinning forever.
    pub async fn drain_remaining(&self) -> Result<()> {
        let mut stalled = 0u32;
        loop {
            let depth_before = self.queue_depth();
            if depth_before == 0 {
                break;
            }
            info!(remaining = depth_before, "flushing staged audit rows");

            self.flush_once().await;

            if self.queue_depth() >= depth_before {
                stalled += 1;
                if stalled >= MAX_STALLED_DRAIN_FLUSHES {
                    error!(
                        remaining = self.queue_depth(),
                        "shutdown drain made no progress, abandoning staged rows"
                    );
                    break;
                }
            } else {
                stalled = 0;
            }
        }
        Ok(())
    }

    /// Spawn the periodic flush task. It flushes on every tick and performs
    /// a final drain when the shutdown channel fires.
    pub fn spawn_flush_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(self.config.flush_interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("flush task shutting down, draining staged rows");
                        if let Err(e) = self.drain_remaining().await {
                            error!("final drain failed: {}", e);
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                }
            }
        })
    }

    /// Rows currently staged for the next flush.
    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Permits currently available to `enqueue`.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn update_gauges(&self) {
        self.metrics
            .persist_queue_depth
            .set(self.queue_depth() as i64);
        self.metrics
            .persist_permits_available
            .set(self.available_permits() as i64);
    }
}
