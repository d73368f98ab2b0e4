//! Fast-cache and distributed-lock capabilities backed by Redis.
//!
//! Both are expressed as traits so the idempotency engine can be exercised
//! against in-memory implementations and the coordination backend can be
//! swapped without touching the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Low-latency key/value store with per-key expiry.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// Distributed mutual exclusion keyed by an arbitrary string.
///
/// `try_lock` waits up to `wait` for acquisition; an acquired lock expires
/// on its own after `lease` if never unlocked.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn try_lock(&self, key: &str, wait: Duration, lease: Duration) -> Result<bool>;

    async fn unlock(&self, key: &str) -> Result<()>;
}

/// Redis-backed `FastCache`.
#[derive(Clone)]
pub struct RedisCache {
    redis: SharedConnectionManager,
}

impl RedisCache {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }

    /// Liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.lock().await.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;
        if pong.eq_ignore_ascii_case("pong") {
            Ok(())
        } else {
            Err(AppError::Internal(format!("unexpected PING reply: {}", pong)))
        }
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.lock().await.clone();
        let exists: bool = conn.exists(key).await.map_err(AppError::Redis)?;
        Ok(exists)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.lock().await.clone();
        let ttl_seconds = usize::try_from(ttl.as_secs()).map_err(|_| {
            AppError::Validation("cache TTL exceeds platform limits".to_string())
        })?;

        let _: () = conn
            .set_options(
                key,
                value,
                redis::SetOptions::default().with_expiration(redis::SetExpiry::EX(ttl_seconds)),
            )
            .await
            .map_err(|e| {
                error!("Failed to set cache key {}: {}", key, e);
                AppError::Redis(e)
            })?;

        debug!(key = %key, ttl_seconds, "cache marker set");
        Ok(())
    }
}

/// How often an unacquired lock is re-attempted within the wait window.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Redis-backed `DistributedLock` using `SET NX PX` with a per-acquisition
/// token and a scripted compare-and-delete unlock, so an expired lock held
/// by someone else is never released by mistake.
pub struct RedisLock {
    redis: SharedConnectionManager,
    unlock_script: redis::Script,
    tokens: StdMutex<HashMap<String, String>>,
}

impl RedisLock {
    pub fn new(redis: SharedConnectionManager) -> Self {
        let unlock_script = redis::Script::new(
            r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
            "#,
        );
        Self {
            redis,
            unlock_script,
            tokens: StdMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, wait: Duration, lease: Duration) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = usize::try_from(lease.as_millis()).map_err(|_| {
            AppError::Validation("lock lease exceeds platform limits".to_string())
        })?;
        let deadline = Instant::now() + wait;

        loop {
            let mut conn = self.redis.lock().await.clone();
            let acquired: bool = conn
                .set_options(
                    key,
                    token.as_str(),
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(lease_ms)),
                )
                .await
                .map_err(AppError::Redis)?;

            if acquired {
                self.tokens
                    .lock()
                    .expect("lock token map poisoned")
                    .insert(key.to_string(), token);
                debug!(key = %key, "distributed lock acquired");
                return Ok(true);
            }

            if Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                return Ok(false);
            }
            sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let token = self
            .tokens
            .lock()
            .expect("lock token map poisoned")
            .remove(key);

        let Some(token) = token else {
            debug!(key = %key, "unlock called without a held token");
            return Ok(());
        };

        let mut conn = self.redis.lock().await.clone();
        let released: i64 = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(AppError::Redis)?;

        if released == 0 {
            debug!(key = %key, "lock already expired before unlock");
        }
        Ok(())
    }
}
