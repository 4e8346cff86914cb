//! Clients for the shared tiers.
//!
//! ## Architecture
//!
//! ```text
//! TieredCache ──► GuardedBackend ──► CircuitBreaker.allow()
//!                      │                   │ closed / half-open
//!                      │                   ▼
//!                      └── timeout ──► BackendClient (Redis | Memory)
//! ```
//!
//! Every call through [`GuardedBackend`] is bounded by the tier timeout,
//! reported to the breaker and counted in [`CacheMetrics`]. Backends signal
//! outages with `CacheError::BackendUnavailable` / `CacheError::Timeout`,
//! which are the only errors that move the breaker.

pub mod memory;
pub mod redis;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use marketcache_core::{CacheError, CacheResult, Tier};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::{BackendConfig, BreakerConfig};
use crate::metrics::CacheMetrics;

/// Raw messages received on a subscribed channel.
pub type EventStream = BoxStream<'static, Vec<u8>>;

/// Thin client to a shared key/value service.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn tier(&self) -> Tier;

    /// Human readable endpoint for logs (no credentials).
    fn endpoint(&self) -> String;

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn publish(&self, channel: &str, message: &[u8]) -> CacheResult<()>;

    /// Open a dedicated subscription. The stream ends when the connection drops.
    async fn subscribe(&self, channel: &str) -> CacheResult<EventStream>;

    async fn ping(&self) -> CacheResult<()>;

    /// Connection pool usage for health reports, when the client pools.
    fn pool_detail(&self) -> Option<String> {
        None
    }
}

/// Create the client for a shared tier from configuration.
///
/// Returns `None` when the tier is disabled or its endpoint cannot even be
/// parsed. A backend that is merely down at startup is still returned: the
/// circuit breaker takes over and the tier comes back once the service does.
pub async fn connect_backend(tier: Tier, config: &BackendConfig) -> Option<Arc<dyn BackendClient>> {
    if !config.enabled {
        tracing::info!(tier = %tier, "tier disabled");
        return None;
    }

    let backend = match RedisBackend::new(tier, config) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(tier = %tier, error = %e, "failed to create backend client, tier disabled");
            return None;
        }
    };

    match backend.ping().await {
        Ok(()) => tracing::info!(tier = %tier, endpoint = %backend.endpoint(), "connected"),
        Err(e) => tracing::warn!(
            tier = %tier,
            endpoint = %backend.endpoint(),
            error = %e,
            "backend unreachable at startup, relying on circuit breaker"
        ),
    }
    Some(Arc::new(backend))
}

/// A backend client behind its circuit breaker and timeout.
pub struct GuardedBackend {
    client: Arc<dyn BackendClient>,
    breaker: CircuitBreaker,
    timeout: Duration,
    metrics: Arc<CacheMetrics>,
}

impl GuardedBackend {
    pub fn new(
        client: Arc<dyn BackendClient>,
        breaker: CircuitBreaker,
        timeout: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            client,
            breaker,
            timeout,
            metrics,
        }
    }

    /// Guard `client` with a breaker built from `config`.
    pub fn from_config(
        client: Arc<dyn BackendClient>,
        config: &BreakerConfig,
        timeout: Duration,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let breaker = CircuitBreaker::from_config(client.tier(), config);
        Self::new(client, breaker, timeout, metrics)
    }

    pub fn tier(&self) -> Tier {
        self.client.tier()
    }

    pub fn client(&self) -> &Arc<dyn BackendClient> {
        &self.client
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> CacheResult<(T, Duration)>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let tier = self.tier();
        if !self.breaker.allow() {
            tracing::debug!(tier = %tier, op, "circuit open, call skipped");
            return Err(CacheError::CircuitOpen { tier });
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                tier,
                after: self.timeout,
            }),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                if e.is_transient() {
                    self.breaker.record_failure();
                } else {
                    // The backend answered.
                    self.breaker.record_success();
                }
                self.metrics.record_tier_error(tier, e);
                tracing::warn!(tier = %tier, op, error = %e, "backend call failed");
            }
        }
        self.metrics.set_circuit_state(tier, self.breaker.state());

        result.map(|value| (value, elapsed))
    }

    pub async fn get(&self, key: &str) -> CacheResult<(Option<Vec<u8>>, Duration)> {
        self.call("get", self.client.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let ((), elapsed) = self.call("set", self.client.set(key, value, ttl)).await?;
        self.metrics.record_tier_latency(self.tier(), elapsed);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        self.call("delete", self.client.delete(key)).await.map(|_| ())
    }

    pub async fn publish(&self, channel: &str, message: &[u8]) -> CacheResult<()> {
        self.call("publish", self.client.publish(channel, message))
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for GuardedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedBackend")
            .field("tier", &self.tier())
            .field("endpoint", &self.client.endpoint())
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded(backend: &MemoryBackend, threshold: u32, cooldown: Duration) -> GuardedBackend {
        GuardedBackend::new(
            Arc::new(backend.clone()),
            CircuitBreaker::new(backend.tier(), threshold, cooldown),
            Duration::from_millis(100),
            Arc::new(CacheMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_open_breaker_skips_network() {
        let backend = MemoryBackend::new(Tier::Fast);
        let guarded = guarded(&backend, 5, Duration::from_secs(60));
        backend.set_available(false);

        for _ in 0..5 {
            assert!(guarded.get("market:overview").await.is_err());
        }
        assert_eq!(guarded.circuit_state(), CircuitState::Open);

        let calls_before = backend.call_count();
        let started = Instant::now();
        let err = guarded.get("market:overview").await.unwrap_err();
        assert!(matches!(err, CacheError::CircuitOpen { tier: Tier::Fast }));
        assert_eq!(backend.call_count(), calls_before);
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_breaker() {
        let backend = MemoryBackend::new(Tier::Durable);
        let guarded = guarded(&backend, 1, Duration::from_millis(30));

        backend.set_available(false);
        assert!(guarded.get("k:a").await.is_err());
        assert_eq!(guarded.circuit_state(), CircuitState::Open);

        backend.set_available(true);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(guarded.get("k:a").await.is_ok());
        assert_eq!(guarded.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_lets_one_call_through() {
        let backend = MemoryBackend::new(Tier::Fast);
        let guarded = guarded(&backend, 1, Duration::from_millis(30));

        backend.set_available(false);
        assert!(guarded.get("k:a").await.is_err());
        backend.set_available(true);
        backend.set_latency(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let calls_before = backend.call_count();
        let (probe, other) = tokio::join!(guarded.get("k:a"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            guarded.get("k:b").await
        });
        assert!(probe.is_ok());
        assert!(matches!(other, Err(CacheError::CircuitOpen { tier: Tier::Fast })));
        assert_eq!(backend.call_count(), calls_before + 1);
        assert_eq!(guarded.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = MemoryBackend::new(Tier::Fast);
        backend.set_latency(Duration::from_millis(300));
        let guarded = guarded(&backend, 5, Duration::from_secs(60));

        let err = guarded.set("k:a", b"1", Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(guarded.breaker().consecutive_failures(), 1);
    }
}
