//! Durable store for the processed-message audit trail.

use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::ProcessedMessage;

/// Relational store holding one row per processed message.
///
/// `message_id` carries a unique constraint; `save`/`save_all` treat a
/// conflicting insert as a no-op so concurrent first-writers never fail.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool>;

    async fn save(&self, record: &ProcessedMessage) -> Result<()>;

    async fn save_all(&self, records: &[ProcessedMessage]) -> Result<()>;
}

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedMessageStore for PgMessageStore {
    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_messages WHERE message_id = $1
            ) AS exists
            "#,
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let exists: bool = row.try_get("exists").map_err(AppError::Database)?;
        Ok(exists)
    }

    async fn save(&self, record: &ProcessedMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_messages (
                message_id, event_type, payload, source, correlation_id,
                message_timestamp, processed_at, status, retry_count, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(&record.source)
        .bind(&record.correlation_id)
        .bind(record.message_timestamp)
        .bind(record.processed_at)
        .bind(record.status.as_str())
        .bind(record.retry_count)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn save_all(&self, records: &[ProcessedMessage]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO processed_messages (\
             message_id, event_type, payload, source, correlation_id, \
             message_timestamp, processed_at, status, retry_count, error_message) ",
        );
        builder.push_values(records, |mut b, record| {
            b.push_bind(&record.message_id)
                .push_bind(&record.event_type)
                .push_bind(&record.payload)
                .push_bind(&record.source)
                .push_bind(&record.correlation_id)
                .push_bind(record.message_timestamp)
                .push_bind(record.processed_at)
                .push_bind(record.status.as_str())
                .push_bind(record.retry_count)
                .push_bind(&record.error_message);
        });
        builder.push(" ON CONFLICT (message_id) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        debug!(
            requested = records.len(),
            inserted = result.rows_affected(),
            "bulk write of processed messages"
        );
        Ok(())
    }
}
