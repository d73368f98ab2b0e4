use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Raw record pulled from the ingest topic, before deserialization.
///
/// Carries the transport coordinates for logging and the original
/// key/value bytes so a failing record can be republished to the
/// dead-letter topic unchanged.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Decoded domain message.
///
/// `message_id` is the sole deduplication key: two messages with the same
/// id are the same logical event regardless of any other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,

    pub event_type: String,

    pub payload: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(AppError::Validation("Message ID is blank".to_string()));
        }

        if self.message_id.len() > 255 {
            return Err(AppError::Validation(format!(
                "Message ID too long: {} characters (max 255)",
                self.message_id.len()
            )));
        }

        if self.event_type.trim().is_empty() {
            return Err(AppError::Validation("Event type is blank".to_string()));
        }

        Ok(())
    }
}

/// Outcome of one processing attempt, produced exactly once per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// First successful processing of this message id.
    Success { message_id: String },

    /// The message id was already processed (or another worker won the
    /// mark race, or the mark lock timed out).
    Duplicate { message_id: String },

    /// The handler or a dedup operation failed terminally.
    Failure { message_id: String, reason: String },
}

impl ProcessingOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            ProcessingOutcome::Success { message_id }
            | ProcessingOutcome::Duplicate { message_id }
            | ProcessingOutcome::Failure { message_id, .. } => message_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ProcessingOutcome::Duplicate { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ProcessingOutcome::Failure { .. })
    }
}

/// Terminal status recorded in the audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Failed,
    Duplicate,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "SUCCESS",
            ProcessingStatus::Failed => "FAILED",
            ProcessingStatus::Duplicate => "DUPLICATE",
        }
    }
}

/// Durable audit row, one per distinct message id.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub event_type: String,
    pub payload: String,
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub message_timestamp: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
    pub status: ProcessingStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

impl ProcessedMessage {
    pub fn from_message(
        message: &Message,
        status: ProcessingStatus,
        error_message: Option<String>,
    ) -> Self {
        Self {
            message_id: message.message_id.clone(),
            event_type: message.event_type.clone(),
            payload: message.payload.clone(),
            source: message.source.clone(),
            correlation_id: message.correlation_id.clone(),
            message_timestamp: message.timestamp,
            processed_at: Utc::now(),
            status,
            retry_count: 0,
            error_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            message_id: "msg-123".to_string(),
            event_type: "ORDER_CREATED".to_string(),
            payload: r#"{"orderId": "12345"}"#.to_string(),
            source: Some("api-test".to_string()),
            correlation_id: Some("corr-001".to_string()),
            timestamp: Some(Utc::now()),
        }
    }

    #[test]
    fn test_message_validation() {
        assert!(sample_message().validate().is_ok());

        let blank_id = Message {
            message_id: "  ".to_string(),
            ..sample_message()
        };
        assert!(blank_id.validate().is_err());

        let long_id = Message {
            message_id: "x".repeat(256),
            ..sample_message()
        };
        assert!(long_id.validate().is_err());

        let blank_type = Message {
            event_type: "".to_string(),
            ..sample_message()
        };
        assert!(blank_type.validate().is_err());
    }

    #[test]
    fn test_message_deserialization() {
        let json = r#"{
            "message_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "ORDER_CREATED",
            "payload": "{\"orderId\": \"12345\", \"amount\": 99.99}",
            "source": "api-test",
            "correlation_id": "corr-001"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();

        assert_eq!(message.message_id, "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(message.event_type, "ORDER_CREATED");
        assert_eq!(message.source.as_deref(), Some("api-test"));
        assert!(message.timestamp.is_none());
    }

    #[test]
    fn test_message_without_optional_fields() {
        let json = r#"{
            "message_id": "m1",
            "event_type": "PAYMENT_RECEIVED",
            "payload": "p"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();

        assert_eq!(message.message_id, "m1");
        assert!(message.source.is_none());
        assert!(message.correlation_id.is_none());
    }

    #[test]
    fn test_outcome_classification() {
        let success = ProcessingOutcome::Success {
            message_id: "m1".to_string(),
        };
        assert!(success.is_success());
        assert!(!success.is_duplicate());
        assert_eq!(success.message_id(), "m1");

        let failure = ProcessingOutcome::Failure {
            message_id: "m2".to_string(),
            reason: "handler exploded".to_string(),
        };
        assert!(failure.is_failure());
        assert_eq!(failure.message_id(), "m2");
    }

    #[test]
    fn test_processed_message_from_message() {
        let message = sample_message();
        let record = ProcessedMessage::from_message(
            &message,
            ProcessingStatus::Failed,
            Some("boom".to_string()),
        );

        assert_eq!(record.message_id, message.message_id);
        assert_eq!(record.status.as_str(), "FAILED");
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }
}
