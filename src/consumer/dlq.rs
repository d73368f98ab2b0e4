//! Dead-letter routing for records the pipeline could not process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error, warn};

use crate::config::KafkaConfig;
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::models::InboundRecord;

const DLQ_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Side channel for records that could not be processed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Republish the original record, annotated only by `reason` in the
    /// call and the log line. Never fails upward: an unreachable sink is
    /// logged and the record is lost.
    async fn send(&self, record: &InboundRecord, reason: &str);
}

/// Kafka-backed dead-letter router publishing the original key/value pair
/// unchanged to a configured topic.
pub struct DeadLetterRouter {
    producer: FutureProducer,
    topic: String,
    metrics: Arc<PipelineMetrics>,
}

impl DeadLetterRouter {
    pub fn new(config: &KafkaConfig, metrics: Arc<PipelineMetrics>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("retries", "3")
            .create()?;

        Ok(Self {
            producer,
            topic: config.dlq_topic.clone(),
            metrics,
        })
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterRouter {
    async fn send(&self, record: &InboundRecord, reason: &str) {
        warn!(
            reason = %reason,
            partition = record.partition,
            offset = record.offset,
            "Sending record to dead-letter topic"
        );

        let mut future_record =
            FutureRecord::<str, [u8]>::to(&self.topic).payload(record.payload.as_slice());
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self.producer.send(future_record, DLQ_SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                self.metrics.messages_dead_lettered.inc();
                debug!(partition, offset, "record dead-lettered");
            }
            Err((e, _)) => {
                // No further fallback: the failure record is lost.
                error!("Failed to publish record to dead-letter topic: {}", e);
            }
        }
    }
}
