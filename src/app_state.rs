use std::sync::Arc;

use prometheus::Registry;
use sqlx::PgPool;

use crate::cache::RedisCache;
use crate::producer::KafkaMessageProducer;
use crate::services::BatchPersistService;

/// Shared state for the HTTP surface.
pub struct AppState {
    pub producer: Arc<KafkaMessageProducer>,
    pub persistence: Arc<BatchPersistService>,
    pub redis: RedisCache,
    pub db_pool: PgPool,
    pub registry: Registry,
}
