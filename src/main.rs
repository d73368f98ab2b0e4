use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{watch, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_ingest_service::app_state::AppState;
use event_ingest_service::cache::{DistributedLock, FastCache, RedisCache, RedisLock};
use event_ingest_service::config::AppConfig;
use event_ingest_service::consumer::{
    DeadLetterRouter, DeadLetterSink, IngestBuffer, IngestDispatcher, KafkaIngestConsumer,
};
use event_ingest_service::db::{PgMessageStore, ProcessedMessageStore};
use event_ingest_service::metrics::PipelineMetrics;
use event_ingest_service::producer::KafkaMessageProducer;
use event_ingest_service::routes;
use event_ingest_service::services::{
    BatchPersistService, HandlerRegistry, IdempotencyService, MessageProcessor,
};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,event_ingest_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        concurrency = config.kafka.listener_concurrency,
        "Starting event-ingest-service"
    );

    // Durable store
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run migrations")?;

    // Fast cache + lock
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("Failed to construct Redis client")?;
    let redis_manager = ConnectionManager::new(redis_client)
        .await
        .context("Failed to initialize Redis connection manager")?;
    let redis = Arc::new(Mutex::new(redis_manager));

    // Metrics, injected into every component
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PipelineMetrics::new(&registry));

    // Pipeline components
    let store: Arc<dyn ProcessedMessageStore> = Arc::new(PgMessageStore::new(db_pool.clone()));
    let cache: Arc<dyn FastCache> = Arc::new(RedisCache::new(redis.clone()));
    let lock: Arc<dyn DistributedLock> = Arc::new(RedisLock::new(redis.clone()));

    let persistence = Arc::new(BatchPersistService::new(
        store.clone(),
        config.persistence.clone(),
        metrics.clone(),
    ));
    let idempotency = Arc::new(IdempotencyService::new(
        cache,
        lock,
        store,
        persistence.clone(),
        config.idempotency.clone(),
        metrics.clone(),
    ));
    let processor = Arc::new(MessageProcessor::new(
        idempotency,
        Arc::new(HandlerRegistry::with_defaults()),
        metrics.clone(),
    ));
    let dlq: Arc<dyn DeadLetterSink> = Arc::new(DeadLetterRouter::new(
        &config.kafka,
        metrics.clone(),
    )?);

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let (buffer, buffer_rx) = IngestBuffer::channel(metrics.clone());
    let dispatcher = IngestDispatcher::new(buffer_rx, processor, dlq, metrics.clone());
    let dispatcher_handle = dispatcher.spawn(shutdown_rx.clone());
    let flush_handle = persistence.clone().spawn_flush_task(shutdown_rx.clone());

    let mut consumer_handles = Vec::with_capacity(config.kafka.listener_concurrency);
    for slot in 0..config.kafka.listener_concurrency {
        let consumer = KafkaIngestConsumer::new(&config.kafka, buffer.clone())
            .with_context(|| format!("Failed to create Kafka consumer {}", slot))?;
        consumer_handles.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    // HTTP surface
    let producer = Arc::new(KafkaMessageProducer::new(&config.kafka)?);
    let state = web::Data::new(AppState {
        producer,
        persistence: persistence.clone(),
        redis: RedisCache::new(redis),
        db_pool,
        registry,
    });

    tracing::info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);
    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes::configure))
        .bind(("0.0.0.0", config.http_port))
        .context("Failed to bind HTTP server")?
        .run()
        .await
        .context("HTTP server error")?;

    // The HTTP server exits on SIGINT/SIGTERM; drain the pipeline before
    // the process goes away.
    tracing::info!("HTTP server stopped, shutting down pipeline");
    let _ = shutdown_tx.send(());

    for handle in consumer_handles {
        let _ = handle.await;
    }
    let _ = dispatcher_handle.await;
    let _ = flush_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
