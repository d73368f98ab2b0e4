//! Two-tier idempotency engine: fast cache in front, durable store behind,
//! with a distributed lock making the check-then-mark critical section
//! race-safe across concurrent consumers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::cache::{DistributedLock, FastCache};
use crate::config::IdempotencyConfig;
use crate::db::ProcessedMessageStore;
use crate::metrics::PipelineMetrics;
use crate::models::ProcessedMessage;
use crate::services::persistence::BatchPersistService;

const CACHE_KEY_PREFIX: &str = "idempotency:";
const LOCK_KEY_PREFIX: &str = "lock:idempotency:";

/// How long `mark_as_processed` waits for the lock.
const LOCK_WAIT: Duration = Duration::from_secs(5);
/// How long an acquired lock may be held before it expires on its own.
const LOCK_LEASE: Duration = Duration::from_secs(10);

pub struct IdempotencyService {
    cache: Arc<dyn FastCache>,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn ProcessedMessageStore>,
    persistence: Arc<BatchPersistService>,
    config: IdempotencyConfig,
    metrics: Arc<PipelineMetrics>,
}

impl IdempotencyService {
    pub fn new(
        cache: Arc<dyn FastCache>,
        lock: Arc<dyn DistributedLock>,
        store: Arc<dyn ProcessedMessageStore>,
        persistence: Arc<BatchPersistService>,
        config: IdempotencyConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            cache,
            lock,
            store,
            persistence,
            config,
            metrics,
        }
    }

    /// Check whether a message id has already been processed.
    ///
    /// The fast cache answers first. A cache miss or a cache error falls
    /// open to the durable store when fallback is enabled: dedup checking
    /// stays available even when the cache is not.
    pub async fn is_already_processed(&self, message_id: &str) -> bool {
        let cache_key = format!("{}{}", CACHE_KEY_PREFIX, message_id);

        match self.cache.exists(&cache_key).await {
            Ok(true) => {
                debug!(message_id = %message_id, "already processed (cache hit)");
                self.metrics.cache_hits.inc();
                self.metrics.duplicates_detected.inc();
                return true;
            }
            Ok(false) => {
                self.metrics.cache_misses.inc();
            }
            Err(e) => {
                warn!(
                    message_id = %message_id,
                    "Cache error during dedup check: {}. Falling back to durable store",
                    e
                );
                self.metrics.cache_errors.inc();
            }
        }

        if self.config.fallback_enabled {
            return self.check_in_store(message_id).await;
        }

        false
    }

    /// Mark a message id as processed and stage its audit row.
    ///
    /// Returns `true` when this caller won the right to the single
    /// persisted copy. Returns `false` when another worker already marked
    /// the id, or the lock could not be acquired in time (the caller must
    /// then treat the delivery as a transient duplicate), or the cache
    /// marker could not be written.
    pub async fn mark_as_processed(&self, message_id: &str, record: ProcessedMessage) -> bool {
        let lock_key = format!("{}{}", LOCK_KEY_PREFIX, message_id);

        match self.lock.try_lock(&lock_key, LOCK_WAIT, LOCK_LEASE).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(message_id = %message_id, "Could not acquire lock within timeout");
                return false;
            }
            Err(e) => {
                error!(message_id = %message_id, "Lock acquisition failed: {}", e);
                return false;
            }
        }

        let marked = self.mark_locked(message_id, record).await;

        if let Err(e) = self.lock.unlock(&lock_key).await {
            warn!(message_id = %message_id, "Failed to release lock: {}", e);
        }

        marked
    }

    /// The check-then-mark critical section. Caller holds the lock.
    async fn mark_locked(&self, message_id: &str, record: ProcessedMessage) -> bool {
        // Close the race where two deliveries both passed the outer check.
        if self.is_already_processed(message_id).await {
            debug!(message_id = %message_id, "already marked by another worker");
            return false;
        }

        let cache_key = format!("{}{}", CACHE_KEY_PREFIX, message_id);
        let marker = Utc::now().timestamp_millis().to_string();
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);

        if let Err(e) = self.cache.set_with_ttl(&cache_key, &marker, ttl).await {
            error!(message_id = %message_id, "Failed to write dedup marker: {}", e);
            self.metrics.cache_errors.inc();
            return false;
        }

        if self.config.fallback_enabled && !self.persistence.enqueue(record).await {
            // The dedup marker stands; only the audit row was shed.
            warn!(message_id = %message_id, "audit row rejected by backpressure");
        }

        debug!(message_id = %message_id, "marked as processed");
        true
    }

    async fn check_in_store(&self, message_id: &str) -> bool {
        match self.store.exists_by_message_id(message_id).await {
            Ok(true) => {
                debug!(message_id = %message_id, "already processed (durable store hit)");
                self.metrics.store_hits.inc();
                self.metrics.duplicates_detected.inc();
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(message_id = %message_id, "Durable store dedup check failed: {}", e);
                false
            }
        }
    }
}
