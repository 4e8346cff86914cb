//! Redis-protocol backend.
//!
//! Commands go through a bounded `deadpool-redis` pool whose wait, create and
//! recycle timeouts equal the tier timeout, so pool exhaustion surfaces as a
//! `Timeout` instead of queuing without bound. SUBSCRIBE needs a dedicated
//! connection and cannot use pooled ones, so `subscribe` opens its own.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, PoolError, Runtime, redis::AsyncCommands};
use futures_util::StreamExt;
use marketcache_core::{CacheError, CacheResult, MAX_TTL, Tier};

use super::{BackendClient, EventStream};
use crate::config::BackendConfig;

pub struct RedisBackend {
    tier: Tier,
    pool: Pool,
    client: redis::Client,
    endpoint: String,
    timeout: Duration,
}

impl RedisBackend {
    /// Build the pool and pub/sub client. Does not touch the network.
    pub fn new(tier: Tier, config: &BackendConfig) -> CacheResult<Self> {
        let url = config.url();
        let timeout = config.timeout();

        let mut redis_config = deadpool_redis::Config::from_url(url.clone());
        let pool_config = redis_config
            .pool
            .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::configuration(format!("{tier} tier pool: {e}")))?;
        let client = redis::Client::open(url.as_str())
            .map_err(|e| CacheError::configuration(format!("{tier} tier url: {e}")))?;

        Ok(Self {
            tier,
            pool,
            client,
            endpoint: format!("redis://{}:{}/{}", config.host, config.port, config.db),
            timeout,
        })
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => CacheError::Timeout {
                tier: self.tier,
                after: self.timeout,
            },
            other => CacheError::unavailable(self.tier, format!("pool: {other}")),
        })
    }

    fn classify(&self, e: redis::RedisError) -> CacheError {
        if e.is_timeout() {
            CacheError::Timeout {
                tier: self.tier,
                after: self.timeout,
            }
        } else {
            CacheError::unavailable(self.tier, e.to_string())
        }
    }

    /// Pool status for diagnostics: (size, available).
    pub fn pool_status(&self) -> (usize, usize) {
        let status = self.pool.status();
        (status.size, status.available)
    }
}

#[async_trait]
impl BackendClient for RedisBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| self.classify(e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        // PX keeps sub-second TTLs; Redis rejects 0.
        let ttl_ms = u64::try_from(ttl.min(MAX_TTL).as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value, ttl_ms)
            .await
            .map_err(|e| self.classify(e))
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(|e| self.classify(e))
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(|e| self.classify(e))
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<EventStream> {
        let mut pubsub = tokio::time::timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| CacheError::Timeout {
                tier: self.tier,
                after: self.timeout,
            })?
            .map_err(|e| self.classify(e))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| self.classify(e))?;

        tracing::info!(tier = %self.tier, channel, "subscribed to channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }

    fn pool_detail(&self) -> Option<String> {
        let (size, available) = self.pool_status();
        Some(format!("pool {available}/{size} idle"))
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("tier", &self.tier)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}
