//! Liveness, readiness and metrics endpoints.

use actix_web::{web, HttpResponse};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::warn;

use crate::app_state::AppState;
use crate::error::{AppError, Result};

#[derive(Serialize)]
struct ReadinessResponse {
    status: String,
    database: String,
    redis: String,
}

#[derive(Serialize)]
struct PipelineStats {
    persist_queue_depth: usize,
    persist_permits_available: usize,
}

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// GET /ready
///
/// Postgres down makes the service unready. Redis down does not: the
/// idempotency engine fails open to the durable store, so readiness is
/// only degraded.
pub async fn ready(state: web::Data<AppState>) -> HttpResponse {
    let database_up = sqlx::query("SELECT 1")
        .execute(&state.db_pool)
        .await
        .is_ok();

    let redis_up = match state.redis.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Redis health check failed: {}", e);
            false
        }
    };

    let response = ReadinessResponse {
        status: if database_up { "READY" } else { "NOT_READY" }.to_string(),
        database: if database_up { "up" } else { "down" }.to_string(),
        redis: if redis_up {
            "up".to_string()
        } else {
            "down (fallback enabled - using durable store)".to_string()
        },
    };

    if database_up {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

/// GET /api/v1/pipeline/stats
///
/// Point-in-time view of the persistence pipeline, for diagnostics.
pub async fn pipeline_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(PipelineStats {
        persist_queue_depth: state.persistence.queue_depth(),
        persist_permits_available: state.persistence.available_permits(),
    })
}

/// GET /metrics
pub async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|e| AppError::Internal(format!("failed to encode metrics: {}", e)))?;
    let body = String::from_utf8(buffer)
        .map_err(|e| AppError::Internal(format!("metrics are not valid UTF-8: {}", e)))?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}
