//! Per-message processing: dedup check, handler dispatch, dedup mark,
//! outcome classification.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::models::{Message, ProcessedMessage, ProcessingOutcome, ProcessingStatus};
use crate::services::events::HandlerRegistry;
use crate::services::idempotency::IdempotencyService;

pub struct MessageProcessor {
    idempotency: Arc<IdempotencyService>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<PipelineMetrics>,
}

impl MessageProcessor {
    pub fn new(
        idempotency: Arc<IdempotencyService>,
        handlers: Arc<HandlerRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            idempotency,
            handlers,
            metrics,
        }
    }

    /// Run one processing attempt for a decoded message.
    ///
    /// Every failure is absorbed into the returned outcome; this never
    /// propagates an error to the dispatcher.
    pub async fn process(&self, message: &Message) -> ProcessingOutcome {
        let started = Instant::now();
        let outcome = self.process_inner(message).await;
        self.metrics
            .processing_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn process_inner(&self, message: &Message) -> ProcessingOutcome {
        let message_id = message.message_id.clone();
        debug!(message_id = %message_id, "processing message");

        if self.idempotency.is_already_processed(&message_id).await {
            info!(message_id = %message_id, "Duplicate message detected and skipped");
            return ProcessingOutcome::Duplicate { message_id };
        }

        match self.handlers.dispatch(message).await {
            Ok(()) => {
                let record =
                    ProcessedMessage::from_message(message, ProcessingStatus::Success, None);

                if self.idempotency.mark_as_processed(&message_id, record).await {
                    info!(message_id = %message_id, "Message processed successfully");
                    ProcessingOutcome::Success { message_id }
                } else {
                    // Another worker won the mark race (or the lock timed
                    // out); the message must not be persisted twice.
                    warn!(message_id = %message_id, "Mark lost to a concurrent worker");
                    ProcessingOutcome::Duplicate { message_id }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                error!(message_id = %message_id, "Error processing message: {}", reason);

                // Record the failure once so a permanently failing message
                // is not redelivered and reprocessed forever.
                let record = ProcessedMessage::from_message(
                    message,
                    ProcessingStatus::Failed,
                    Some(reason.clone()),
                );
                if !self.idempotency.mark_as_processed(&message_id, record).await {
                    warn!(message_id = %message_id, "Failed to record failure state");
                }

                ProcessingOutcome::Failure { message_id, reason }
            }
        }
    }
}
