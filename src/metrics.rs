use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

/// Metrics for the whole ingest pipeline, registered against an injected
/// registry and shared by the components via `Arc`.
#[derive(Clone)]
pub struct PipelineMetrics {
    // Ingestion
    pub messages_received: IntCounter,
    pub messages_processed: IntCounter,
    pub messages_failed: IntCounter,
    pub messages_dead_lettered: IntCounter,
    pub ingest_buffer_depth: IntGauge,

    // Idempotency
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_errors: IntCounter,
    pub store_hits: IntCounter,
    pub duplicates_detected: IntCounter,

    // Batch persistence
    pub batch_persist_success: IntCounter,
    pub batch_persist_errors: IntCounter,
    pub backpressure_rejections: IntCounter,
    pub persist_queue_depth: IntGauge,
    pub persist_permits_available: IntGauge,

    // Timers
    pub processing_duration_seconds: Histogram,
    pub batch_flush_duration_seconds: Histogram,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Self {
        let messages_received = IntCounter::new(
            "ingest_messages_received_total",
            "Total records received from the ingest topic",
        )
        .expect("valid metric for ingest_messages_received_total");
        let messages_processed = IntCounter::new(
            "ingest_messages_processed_total",
            "Total messages processed successfully",
        )
        .expect("valid metric for ingest_messages_processed_total");
        let messages_failed = IntCounter::new(
            "ingest_messages_failed_total",
            "Total messages whose processing failed",
        )
        .expect("valid metric for ingest_messages_failed_total");
        let messages_dead_lettered = IntCounter::new(
            "ingest_messages_dead_lettered_total",
            "Total records published to the dead-letter topic",
        )
        .expect("valid metric for ingest_messages_dead_lettered_total");
        let ingest_buffer_depth = IntGauge::new(
            "ingest_buffer_depth",
            "Records buffered and waiting for dispatch",
        )
        .expect("valid metric for ingest_buffer_depth");

        let cache_hits = IntCounter::new(
            "idempotency_cache_hits_total",
            "Dedup checks answered by the fast cache",
        )
        .expect("valid metric for idempotency_cache_hits_total");
        let cache_misses = IntCounter::new(
            "idempotency_cache_misses_total",
            "Dedup checks that missed the fast cache",
        )
        .expect("valid metric for idempotency_cache_misses_total");
        let cache_errors = IntCounter::new(
            "idempotency_cache_errors_total",
            "Fast-cache operations that failed",
        )
        .expect("valid metric for idempotency_cache_errors_total");
        let store_hits = IntCounter::new(
            "idempotency_store_hits_total",
            "Dedup checks answered by the durable store fallback",
        )
        .expect("valid metric for idempotency_store_hits_total");
        let duplicates_detected = IntCounter::new(
            "idempotency_duplicates_detected_total",
            "Messages detected as duplicates",
        )
        .expect("valid metric for idempotency_duplicates_detected_total");

        let batch_persist_success = IntCounter::new(
            "persist_batch_success_total",
            "Audit rows persisted via bulk writes",
        )
        .expect("valid metric for persist_batch_success_total");
        let batch_persist_errors = IntCounter::new(
            "persist_batch_errors_total",
            "Audit rows in bulk writes that failed",
        )
        .expect("valid metric for persist_batch_errors_total");
        let backpressure_rejections = IntCounter::new(
            "persist_backpressure_rejections_total",
            "Enqueue attempts rejected by backpressure",
        )
        .expect("valid metric for persist_backpressure_rejections_total");
        let persist_queue_depth = IntGauge::new(
            "persist_queue_depth",
            "Audit rows staged and waiting for the next flush",
        )
        .expect("valid metric for persist_queue_depth");
        let persist_permits_available = IntGauge::new(
            "persist_permits_available",
            "Backpressure permits currently available",
        )
        .expect("valid metric for persist_permits_available");

        let processing_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_processing_duration_seconds",
                "Time spent processing one message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )
        .expect("valid metric for ingest_processing_duration_seconds");
        let batch_flush_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "persist_batch_flush_duration_seconds",
                "Time spent flushing one batch to the durable store",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .expect("valid metric for persist_batch_flush_duration_seconds");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(messages_received.clone()),
            Box::new(messages_processed.clone()),
            Box::new(messages_failed.clone()),
            Box::new(messages_dead_lettered.clone()),
            Box::new(ingest_buffer_depth.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_errors.clone()),
            Box::new(store_hits.clone()),
            Box::new(duplicates_detected.clone()),
            Box::new(batch_persist_success.clone()),
            Box::new(batch_persist_errors.clone()),
            Box::new(backpressure_rejections.clone()),
            Box::new(persist_queue_depth.clone()),
            Box::new(persist_permits_available.clone()),
            Box::new(processing_duration_seconds.clone()),
            Box::new(batch_flush_duration_seconds.clone()),
        ];
        for collector in collectors {
            let _ = registry.register(collector);
        }

        Self {
            messages_received,
            messages_processed,
            messages_failed,
            messages_dead_lettered,
            ingest_buffer_depth,
            cache_hits,
            cache_misses,
            cache_errors,
            store_hits,
            duplicates_detected,
            batch_persist_success,
            batch_persist_errors,
            backpressure_rejections,
            persist_queue_depth,
            persist_permits_available,
            processing_duration_seconds,
            batch_flush_duration_seconds,
        }
    }
}
