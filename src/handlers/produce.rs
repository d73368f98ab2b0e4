//! HTTP endpoints for publishing test records to the ingest topic.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::Result;
use crate::models::Message;

/// Hard cap on messages produced by one batch request.
const MAX_BATCH_COUNT: usize = 10_000;

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchMessageRequest {
    pub event_type: String,
    pub payload_prefix: String,
    pub count: usize,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchMessageResponse {
    pub total_requested: usize,
    pub total_sent: usize,
    pub total_failed: usize,
    pub execution_time_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub message_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct DuplicateTestParams {
    #[serde(default = "default_duplicate_id")]
    pub message_id: String,
    #[serde(default = "default_duplicate_times")]
    pub times: usize,
}

fn default_duplicate_id() -> String {
    "test-duplicate-001".to_string()
}

fn default_duplicate_times() -> usize {
    5
}

/// POST /api/v1/kafka/messages
pub async fn send_message(
    state: web::Data<AppState>,
    body: web::Json<Message>,
) -> Result<HttpResponse> {
    let message = body.into_inner();
    let request_id = message.message_id.clone();

    match state.producer.send(message).await {
        Ok((message, delivery)) => Ok(HttpResponse::Ok().json(MessageResponse {
            message_id: message.message_id,
            status: "SENT".to_string(),
            topic: Some(delivery.topic),
            partition: Some(delivery.partition),
            offset: Some(delivery.offset),
            timestamp: Utc::now(),
            error_message: None,
        })),
        Err(e) => {
            error!("Error sending message: {}", e);
            Ok(HttpResponse::InternalServerError().json(MessageResponse {
                message_id: request_id,
                status: "FAILED".to_string(),
                topic: None,
                partition: None,
                offset: None,
                timestamp: Utc::now(),
                error_message: Some(e.to_string()),
            }))
        }
    }
}

/// POST /api/v1/kafka/messages/batch
pub async fn send_batch(
    state: web::Data<AppState>,
    body: web::Json<BatchMessageRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    let start_time = Utc::now();
    let started = std::time::Instant::now();

    let count = request.count.min(MAX_BATCH_COUNT);
    let correlation_id = format!("batch-{}", start_time.timestamp_millis());

    let mut message_ids = Vec::with_capacity(count);
    let mut sends = Vec::with_capacity(count);
    for i in 0..count {
        let message_id = Uuid::new_v4().to_string();
        message_ids.push(message_id.clone());

        let message = Message {
            message_id,
            event_type: request.event_type.clone(),
            payload: format!("{} #{}", request.payload_prefix, i + 1),
            source: Some(
                request
                    .source
                    .clone()
                    .unwrap_or_else(|| "batch-api".to_string()),
            ),
            correlation_id: Some(correlation_id.clone()),
            timestamp: Some(Utc::now()),
        };
        sends.push(state.producer.send(message));
    }

    let mut sent = 0;
    let mut failed = 0;
    let mut errors = Vec::new();
    for (i, result) in join_all(sends).await.into_iter().enumerate() {
        match result {
            Ok(_) => sent += 1,
            Err(e) => {
                failed += 1;
                errors.push(format!("Message {}: {}", message_ids[i], e));
            }
        }
    }

    Ok(HttpResponse::Ok().json(BatchMessageResponse {
        total_requested: count,
        total_sent: sent,
        total_failed: failed,
        execution_time_ms: started.elapsed().as_millis() as u64,
        start_time,
        end_time: Utc::now(),
        message_ids,
        errors: if errors.is_empty() { None } else { Some(errors) },
    }))
}

/// POST /api/v1/kafka/messages/duplicate-test
///
/// Publishes the same message id N times to exercise deduplication.
pub async fn duplicate_test(
    state: web::Data<AppState>,
    params: web::Query<DuplicateTestParams>,
) -> Result<HttpResponse> {
    let start_time = Utc::now();
    let started = std::time::Instant::now();

    let times = params.times.clamp(2, 100);
    let correlation_id = format!("dup-test-{}", start_time.timestamp_millis());

    let mut sent = 0;
    let mut failed = 0;
    let mut message_ids = Vec::with_capacity(times);
    let mut errors = Vec::new();

    for attempt in 1..=times {
        let message = Message {
            message_id: params.message_id.clone(),
            event_type: "DUPLICATE_TEST".to_string(),
            payload: format!("Duplicate test payload - attempt {}", attempt),
            source: Some("duplicate-test".to_string()),
            correlation_id: Some(correlation_id.clone()),
            timestamp: Some(Utc::now()),
        };

        match state.producer.send(message).await {
            Ok(_) => {
                sent += 1;
                message_ids.push(format!("{} (attempt {})", params.message_id, attempt));
            }
            Err(e) => {
                failed += 1;
                errors.push(format!("Attempt {}: {}", attempt, e));
            }
        }
    }

    Ok(HttpResponse::Ok().json(BatchMessageResponse {
        total_requested: times,
        total_sent: sent,
        total_failed: failed,
        execution_time_ms: started.elapsed().as_millis() as u64,
        start_time,
        end_time: Utc::now(),
        message_ids,
        errors: if errors.is_empty() { None } else { Some(errors) },
    }))
}
