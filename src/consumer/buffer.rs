//! Ingestion buffer and dispatcher.
//!
//! Inbound batches land in an unbounded holding buffer and the transport
//! offset is committed immediately: commit latency is decoupled from
//! processing latency so a slow durable store can never stall the consumer
//! session. A periodic drain task empties the buffer and spawns one
//! lightweight task per record; ordering across messages is given up in
//! exchange.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::consumer::dlq::DeadLetterSink;
use crate::metrics::PipelineMetrics;
use crate::models::{InboundRecord, Message, ProcessingOutcome};
use crate::services::processor::MessageProcessor;

/// Minimum period between buffer drains.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Holding buffer between the transport integration and the dispatcher.
pub struct IngestBuffer {
    tx: UnboundedSender<InboundRecord>,
    metrics: Arc<PipelineMetrics>,
}

impl IngestBuffer {
    /// Create the buffer and the receiving end for its dispatcher.
    pub fn channel(metrics: Arc<PipelineMetrics>) -> (Arc<Self>, UnboundedReceiver<InboundRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, metrics }), rx)
    }

    /// Accept one inbound batch and acknowledge it immediately.
    ///
    /// `commit` is invoked unconditionally after buffering: processing
    /// failures are handled downstream and never delay the offset. A
    /// failing commit is logged and NOT retried; the next poll redelivers
    /// and the idempotency engine absorbs the duplicates.
    pub fn on_batch<C, E>(&self, records: Vec<InboundRecord>, commit: C)
    where
        C: FnOnce() -> std::result::Result<(), E>,
        E: Display,
    {
        let batch_size = records.len();
        self.metrics.messages_received.inc_by(batch_size as u64);

        for record in records {
            if self.tx.send(record).is_err() {
                warn!("dispatcher stopped, dropping buffered record");
                continue;
            }
            self.metrics.ingest_buffer_depth.inc();
        }

        match commit() {
            Ok(()) => debug!(batch_size, "batch buffered and acknowledged"),
            Err(e) => error!(
                batch_size,
                "Offset commit failed, redelivery expected: {}", e
            ),
        }
    }
}

/// Drains the holding buffer and fans records out to per-message tasks.
pub struct IngestDispatcher {
    rx: UnboundedReceiver<InboundRecord>,
    processor: Arc<MessageProcessor>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<PipelineMetrics>,
}

impl IngestDispatcher {
    pub fn new(
        rx: UnboundedReceiver<InboundRecord>,
        processor: Arc<MessageProcessor>,
        dlq: Arc<dyn DeadLetterSink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            rx,
            processor,
            dlq,
            metrics,
        }
    }

    /// Spawn the drain task. Each tick empties the buffer completely and
    /// submits one task per record; the tick never blocks on processing.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(DRAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("ingest dispatcher shutting down");
                        self.drain();
                        break;
                    }
                    _ = ticker.tick() => {
                        self.drain();
                    }
                }
            }
        })
    }

    fn drain(&mut self) {
        let mut submitted = 0;
        while let Ok(record) = self.rx.try_recv() {
            self.metrics.ingest_buffer_depth.dec();

            let processor = Arc::clone(&self.processor);
            let dlq = Arc::clone(&self.dlq);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                process_record(record, processor, dlq, metrics).await;
            });
            submitted += 1;
        }

        if submitted > 0 {
            debug!(submitted, "submitted buffered records for processing");
        }
    }
}

/// Process one raw record end to end.
///
/// Every failure is handled inside this task: undecodable records and
/// failed outcomes go to the dead-letter sink, so a poisoned record never
/// escapes its own task.
pub async fn process_record(
    record: InboundRecord,
    processor: Arc<MessageProcessor>,
    dlq: Arc<dyn DeadLetterSink>,
    metrics: Arc<PipelineMetrics>,
) {
    debug!(
        partition = record.partition,
        offset = record.offset,
        key = record.key.as_deref().unwrap_or(""),
        "processing record"
    );

    let message: Message = match serde_json::from_slice(&record.payload) {
        Ok(message) => message,
        Err(e) => {
            error!(
                offset = record.offset,
                "Failed to deserialize record: {}", e
            );
            dlq.send(&record, &format!("Deserialization failed: {}", e))
                .await;
            return;
        }
    };

    if let Err(e) = message.validate() {
        error!(offset = record.offset, "Invalid message: {}", e);
        dlq.send(&record, &format!("Invalid message: {}", e)).await;
        return;
    }

    match processor.process(&message).await {
        ProcessingOutcome::Success { message_id } => {
            metrics.messages_processed.inc();
            debug!(message_id = %message_id, "record processed");
        }
        ProcessingOutcome::Duplicate { message_id } => {
            debug!(message_id = %message_id, "duplicate record skipped");
        }
        ProcessingOutcome::Failure { message_id, reason } => {
            error!(message_id = %message_id, "record processing failed: {}", reason);
            metrics.messages_failed.inc();
            dlq.send(&record, &reason).await;
        }
    }
}
