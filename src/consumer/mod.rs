pub mod buffer;
pub mod dlq;
pub mod kafka;

pub use buffer::{IngestBuffer, IngestDispatcher};
pub use dlq::{DeadLetterRouter, DeadLetterSink};
pub use kafka::KafkaIngestConsumer;
