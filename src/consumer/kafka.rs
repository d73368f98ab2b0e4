//! Inbound Kafka integration.
//!
//! Polls the ingest topic with auto-commit disabled, assembles ready
//! messages into batches, hands them to the ingestion buffer and commits
//! the high-water offsets immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info};

use crate::config::KafkaConfig;
use crate::consumer::buffer::IngestBuffer;
use crate::error::Result;
use crate::models::InboundRecord;

/// How long batch assembly waits for further ready messages after the
/// first, before handing the batch over. Keeps low-traffic topics from
/// stalling while still grouping bursts.
const BATCH_ASSEMBLY_WINDOW: Duration = Duration::from_millis(50);

pub struct KafkaIngestConsumer {
    consumer: StreamConsumer,
    buffer: Arc<IngestBuffer>,
    max_poll_records: usize,
}

impl KafkaIngestConsumer {
    pub fn new(config: &KafkaConfig, buffer: Arc<IngestBuffer>) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "15000")
            .set("fetch.min.bytes", "1024")
            .set("fetch.wait.max.ms", "500")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                e
            })?;

        consumer.subscribe(&[&config.topic]).map_err(|e| {
            error!("Failed to subscribe to topic {}: {}", config.topic, e);
            e
        })?;

        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            "Kafka ingest consumer subscribed"
        );

        Ok(Self {
            consumer,
            buffer,
            max_poll_records: config.max_poll_records,
        })
    }

    /// Run the poll loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        info!("Starting ingest consumer loop");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("ingest consumer shutting down");
                    break;
                }
                first = self.consumer.recv() => match first {
                    Ok(first) => self.assemble_and_buffer(&first).await,
                    Err(e) => {
                        error!("Kafka consumer error: {}", e);
                        // Avoid a tight error loop while the broker recovers.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Grow a batch from the first ready message, then hand it to the
    /// buffer with a commit callback for its high-water offsets.
    async fn assemble_and_buffer(&self, first: &BorrowedMessage<'_>) {
        let mut records = Vec::with_capacity(self.max_poll_records.min(64));
        let mut offsets: HashMap<(String, i32), i64> = HashMap::new();

        push_record(&mut records, &mut offsets, first);

        while records.len() < self.max_poll_records {
            match timeout(BATCH_ASSEMBLY_WINDOW, self.consumer.recv()).await {
                Ok(Ok(message)) => push_record(&mut records, &mut offsets, &message),
                Ok(Err(e)) => {
                    error!("Kafka consumer error during batch assembly: {}", e);
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        let tpl = match commit_list(&offsets) {
            Ok(tpl) => tpl,
            Err(e) => {
                error!("Failed to build commit list: {}", e);
                self.buffer
                    .on_batch(records, || Ok::<(), rdkafka::error::KafkaError>(()));
                return;
            }
        };

        self.buffer
            .on_batch(records, || self.consumer.commit(&tpl, CommitMode::Async));
    }
}

fn push_record(
    records: &mut Vec<InboundRecord>,
    offsets: &mut HashMap<(String, i32), i64>,
    message: &BorrowedMessage<'_>,
) {
    let record = InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
    };

    let entry = offsets
        .entry((record.topic.clone(), record.partition))
        .or_insert(record.offset);
    if record.offset > *entry {
        *entry = record.offset;
    }

    records.push(record);
}

fn commit_list(offsets: &HashMap<(String, i32), i64>) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in offsets {
        tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))?;
    }
    Ok(tpl)
}
