//! End-to-end pipeline tests over in-memory cache, lock, store and
//! dead-letter implementations. Kafka and the HTTP surface are exercised
//! separately; everything from record bytes to audit rows runs for real.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use prometheus::Registry;
use tokio::time::Instant;

use event_ingest_service::cache::{DistributedLock, FastCache};
use event_ingest_service::config::{IdempotencyConfig, PersistenceConfig};
use event_ingest_service::consumer::buffer::process_record;
use event_ingest_service::consumer::DeadLetterSink;
use event_ingest_service::db::ProcessedMessageStore;
use event_ingest_service::error::{AppError, Result};
use event_ingest_service::metrics::PipelineMetrics;
use event_ingest_service::models::{InboundRecord, Message, ProcessedMessage};
use event_ingest_service::services::events::EventHandler;
use event_ingest_service::services::{
    BatchPersistService, HandlerRegistry, IdempotencyService, MessageProcessor,
};

struct MemoryCache {
    entries: StdMutex<HashMap<String, String>>,
    fail: AtomicBool,
}

impl MemoryCache {
    fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Internal("cache unavailable".to_string()));
        }
        Ok(self.entries.lock().unwrap().contains_key(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Internal("cache unavailable".to_string()));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

struct MemoryLock {
    held: StdMutex<HashSet<String>>,
    deny: AtomicBool,
}

impl MemoryLock {
    fn new() -> Self {
        Self {
            held: StdMutex::new(HashSet::new()),
            deny: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, wait: Duration, _lease: Duration) -> Result<bool> {
        if self.deny.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let deadline = Instant::now() + wait;
        loop {
            if self.held.lock().unwrap().insert(key.to_string()) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.held.lock().unwrap().remove(key);
        Ok(())
    }
}

struct MemoryStore {
    rows: StdMutex<HashMap<String, ProcessedMessage>>,
    bulk_writes: AtomicUsize,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            rows: StdMutex::new(HashMap::new()),
            bulk_writes: AtomicUsize::new(0),
        }
    }

    fn row(&self, message_id: &str) -> Option<ProcessedMessage> {
        self.rows.lock().unwrap().get(message_id).cloned()
    }

    fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessedMessageStore for MemoryStore {
    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool> {
        Ok(self.rows.lock().unwrap().contains_key(message_id))
    }

    async fn save(&self, record: &ProcessedMessage) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .entry(record.message_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn save_all(&self, records: &[ProcessedMessage]) -> Result<()> {
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            // Unique constraint on message_id: the losing insert is a no-op.
            rows.entry(record.message_id.clone())
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }
}

struct MemoryDlq {
    sent: StdMutex<Vec<(InboundRecord, String)>>,
}

impl MemoryDlq {
    fn new() -> Self {
        Self {
            sent: StdMutex::new(Vec::new()),
        }
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn last_reason(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, r)| r.clone())
    }

    fn last_payload(&self) -> Option<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(record, _)| record.payload.clone())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDlq {
    async fn send(&self, record: &InboundRecord, reason: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((record.clone(), reason.to_string()));
    }
}

struct CountingHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn event_type(&self) -> &str {
        "TEST_EVENT"
    }

    async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl EventHandler for FailingHandler {
    fn event_type(&self) -> &str {
        "ALWAYS_FAILS"
    }

    async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
        anyhow::bail!("simulated handler failure")
    }
}

struct Harness {
    processor: Arc<MessageProcessor>,
    persistence: Arc<BatchPersistService>,
    cache: Arc<MemoryCache>,
    lock: Arc<MemoryLock>,
    store: Arc<MemoryStore>,
    dlq: Arc<MemoryDlq>,
    metrics: Arc<PipelineMetrics>,
    handler_invocations: Arc<AtomicUsize>,
}

fn persistence_config() -> PersistenceConfig {
    PersistenceConfig {
        buffer_capacity: 100,
        batch_size: 50,
        max_concurrent_permits: 100,
        flush_interval_ms: 20,
        permit_timeout_ms: 20,
        offer_timeout_ms: 10,
    }
}

fn harness(persistence_config: PersistenceConfig) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let lock = Arc::new(MemoryLock::new());
    let store = Arc::new(MemoryStore::new());
    let dlq = Arc::new(MemoryDlq::new());
    let metrics = Arc::new(PipelineMetrics::new(&Registry::new()));

    let persistence = Arc::new(BatchPersistService::new(
        store.clone(),
        persistence_config,
        metrics.clone(),
    ));
    let idempotency = Arc::new(IdempotencyService::new(
        cache.clone(),
        lock.clone(),
        store.clone(),
        persistence.clone(),
        IdempotencyConfig::default(),
        metrics.clone(),
    ));

    let handler_invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::with_defaults();
    registry.register(Arc::new(CountingHandler {
        invocations: handler_invocations.clone(),
    }));
    registry.register(Arc::new(FailingHandler));

    let processor = Arc::new(MessageProcessor::new(
        idempotency,
        Arc::new(registry),
        metrics.clone(),
    ));

    Harness {
        processor,
        persistence,
        cache,
        lock,
        store,
        dlq,
        metrics,
        handler_invocations,
    }
}

fn message(id: &str, event_type: &str) -> Message {
    Message {
        message_id: id.to_string(),
        event_type: event_type.to_string(),
        payload: "p".to_string(),
        source: Some("test".to_string()),
        correlation_id: None,
        timestamp: None,
    }
}

fn record_for(message: &Message) -> InboundRecord {
    InboundRecord {
        topic: "high-volume-topic".to_string(),
        partition: 0,
        offset: 0,
        key: Some(message.message_id.clone()),
        payload: serde_json::to_vec(message).unwrap(),
    }
}

#[tokio::test]
async fn first_delivery_succeeds_and_redelivery_is_duplicate() {
    let h = harness(persistence_config());
    let m1 = message("m1", "ORDER_CREATED");

    let outcome = h.processor.process(&m1).await;
    assert!(outcome.is_success());

    h.persistence.flush_once().await;
    let row = h.store.row("m1").expect("row persisted");
    assert_eq!(row.status.as_str(), "SUCCESS");
    assert_eq!(h.store.row_count(), 1);

    // Redelivery: detected by the cache, no new row.
    let outcome = h.processor.process(&m1).await;
    assert!(outcome.is_duplicate());
    h.persistence.flush_once().await;
    assert_eq!(h.store.row_count(), 1);

    assert!(h.cache.exists("idempotency:m1").await.unwrap());
    assert!(h.store.exists_by_message_id("m1").await.unwrap());
    assert!(h.metrics.duplicates_detected.get() >= 1);
}

#[tokio::test]
async fn concurrent_deliveries_persist_exactly_once() {
    let h = harness(persistence_config());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let processor = h.processor.clone();
        let m = message("race-1", "TEST_EVENT");
        tasks.push(tokio::spawn(async move { processor.process(&m).await }));
    }

    let mut successes = 0;
    let mut duplicates = 0;
    for task in tasks {
        let outcome = task.await.unwrap();
        if outcome.is_success() {
            successes += 1;
        } else if outcome.is_duplicate() {
            duplicates += 1;
        } else {
            panic!("unexpected failure outcome: {:?}", outcome);
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(duplicates, 7);
    // The lock covers check-then-mark only, not handler execution, so
    // concurrent first deliveries may each reach the handler. The persisted
    // copy is what must stay unique.
    assert!(h.handler_invocations.load(Ordering::SeqCst) >= 1);

    h.persistence.flush_once().await;
    assert_eq!(h.store.row_count(), 1);
}

#[tokio::test]
async fn cache_outage_falls_open_to_durable_store() {
    let h = harness(persistence_config());
    let m = message("m-seeded", "TEST_EVENT");

    // Row already in the durable store from a previous life.
    h.store
        .save(&ProcessedMessage::from_message(
            &m,
            event_ingest_service::models::ProcessingStatus::Success,
            None,
        ))
        .await
        .unwrap();

    h.cache.fail.store(true, Ordering::SeqCst);

    let outcome = h.processor.process(&m).await;
    assert!(outcome.is_duplicate());
    // The handler never ran: dedup stayed correct without the cache.
    assert_eq!(h.handler_invocations.load(Ordering::SeqCst), 0);
    assert_eq!(h.metrics.cache_errors.get(), 1);
    assert_eq!(h.metrics.store_hits.get(), 1);
}

#[tokio::test]
async fn lock_timeout_is_treated_as_transient_duplicate() {
    let h = harness(persistence_config());
    h.lock.deny.store(true, Ordering::SeqCst);

    let outcome = h.processor.process(&message("m-locked", "TEST_EVENT")).await;

    // The handler ran, but the mark was not won: no second copy may be
    // persisted, so the outcome downgrades to Duplicate.
    assert!(outcome.is_duplicate());
    assert_eq!(h.handler_invocations.load(Ordering::SeqCst), 1);
    h.persistence.flush_once().await;
    assert_eq!(h.store.row_count(), 0);
}

#[tokio::test]
async fn handler_failure_is_recorded_once_and_dead_lettered() {
    let h = harness(persistence_config());
    let m = message("m-fail", "ALWAYS_FAILS");
    let record = record_for(&m);

    process_record(
        record,
        h.processor.clone(),
        h.dlq.clone(),
        h.metrics.clone(),
    )
    .await;

    assert_eq!(h.dlq.count(), 1);
    assert!(h
        .dlq
        .last_reason()
        .unwrap()
        .contains("simulated handler failure"));
    assert_eq!(h.metrics.messages_failed.get(), 1);

    h.persistence.flush_once().await;
    let row = h.store.row("m-fail").expect("failure recorded");
    assert_eq!(row.status.as_str(), "FAILED");
    assert!(row
        .error_message
        .as_deref()
        .unwrap()
        .contains("simulated handler failure"));

    // Redelivery does not reprocess a recorded failure.
    let outcome = h.processor.process(&m).await;
    assert!(outcome.is_duplicate());
    assert_eq!(h.dlq.count(), 1);
}

#[tokio::test]
async fn malformed_payload_goes_straight_to_dead_letter() {
    let h = harness(persistence_config());
    let record = InboundRecord {
        topic: "high-volume-topic".to_string(),
        partition: 3,
        offset: 42,
        key: Some("k1".to_string()),
        payload: b"{not json".to_vec(),
    };
    let original_payload = record.payload.clone();

    process_record(
        record,
        h.processor.clone(),
        h.dlq.clone(),
        h.metrics.clone(),
    )
    .await;

    // No handler invocation, exactly one dead-letter publish carrying the
    // original bytes unchanged.
    assert_eq!(h.handler_invocations.load(Ordering::SeqCst), 0);
    assert_eq!(h.dlq.count(), 1);
    assert_eq!(h.dlq.last_payload().unwrap(), original_payload);
    assert!(h.dlq.last_reason().unwrap().contains("Deserialization failed"));
    h.persistence.flush_once().await;
    assert_eq!(h.store.row_count(), 0);
}

#[tokio::test]
async fn backpressure_rejects_instead_of_growing_unbounded() {
    let config = PersistenceConfig {
        buffer_capacity: 4,
        batch_size: 50,
        max_concurrent_permits: 4,
        flush_interval_ms: 1_000,
        permit_timeout_ms: 20,
        offer_timeout_ms: 10,
    };
    let h = harness(config);

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..20 {
        let m = message(&format!("bp-{}", i), "TEST_EVENT");
        let record = ProcessedMessage::from_message(
            &m,
            event_ingest_service::models::ProcessingStatus::Success,
            None,
        );
        if h.persistence.enqueue(record).await {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }

    assert_eq!(accepted, 4);
    assert_eq!(rejected, 16);
    assert_eq!(h.metrics.backpressure_rejections.get(), 16);
    assert!(h.persistence.queue_depth() <= 4);
}

#[tokio::test]
async fn shutdown_drains_staged_rows() {
    let mut config = persistence_config();
    config.buffer_capacity = 200;
    config.max_concurrent_permits = 200;
    config.batch_size = 50;
    let h = harness(config);

    for i in 0..120 {
        let m = message(&format!("drain-{}", i), "TEST_EVENT");
        let record = ProcessedMessage::from_message(
            &m,
            event_ingest_service::models::ProcessingStatus::Success,
            None,
        );
        assert!(h.persistence.enqueue(record).await);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let handle = h.persistence.clone().spawn_flush_task(shutdown_rx);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(h.persistence.queue_depth(), 0);
    assert_eq!(h.store.row_count(), 120);
    assert!(h.store.bulk_writes.load(Ordering::SeqCst) >= 3);
}
