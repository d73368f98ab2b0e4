//! Test-record producer for the HTTP surface.

use std::time::Duration;

use chrono::Utc;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::error::{AppError, Result};
use crate::models::Message;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a published message landed.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Idempotent JSON producer publishing messages keyed by `message_id` to
/// the ingest topic.
pub struct KafkaMessageProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaMessageProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("retries", "3")
            .set("enable.idempotence", "true")
            .set("batch.size", "16384")
            .set("linger.ms", "5")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka producer: {}", e);
                AppError::Kafka(e)
            })?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }

    /// Publish one message, generating an id and timestamp when absent.
    pub async fn send(&self, mut message: Message) -> Result<(Message, DeliveryInfo)> {
        if message.message_id.trim().is_empty() {
            message.message_id = Uuid::new_v4().to_string();
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now());
        }

        let payload = serde_json::to_string(&message)?;
        let record = FutureRecord::to(&self.topic)
            .key(&message.message_id)
            .payload(&payload);

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(
                    message_id = %message.message_id,
                    partition,
                    offset,
                    "message published"
                );
                let delivery = DeliveryInfo {
                    topic: self.topic.clone(),
                    partition,
                    offset,
                };
                Ok((message, delivery))
            }
            Err((e, _)) => {
                error!(message_id = %message.message_id, "Failed to publish message: {}", e);
                Err(AppError::Kafka(e))
            }
        }
    }
}
