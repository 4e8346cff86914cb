//! Shared three-tier cache for market data services.
//!
//! ```text
//! CacheBridge ──► TieredCache ──► LocalTier (LRU, in-process)
//!     │                 ├──────► fast tier    (GuardedBackend: breaker + timeout)
//!     │                 └──────► durable tier (GuardedBackend: breaker + timeout)
//!     └── listener / warming / heartbeat tasks on the shared event channel
//! ```
//!
//! Everything is constructed explicitly; there is no process-wide instance.

pub mod backend;
pub mod breaker;
pub mod bridge;
pub mod config;
pub mod health;
pub mod local;
pub mod metrics;
pub mod observability;
pub mod tiered;

pub use backend::{BackendClient, GuardedBackend, MemoryBackend, RedisBackend, connect_backend};
pub use breaker::{CircuitBreaker, CircuitState};
pub use bridge::{CacheBridge, CacheBridgeBuilder, DefaultValueProvider, SchemaDefaults, WarmReport};
pub use config::{ConfigError, Settings, loader::load_settings};
pub use health::{HealthReport, HealthStatus, TierStatus};
pub use local::LocalTier;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with};
pub use tiered::{TierWrite, TieredCache, TieredCacheBuilder, WriteReport};

pub use marketcache_core::{
    CacheEntry, CacheError, CacheEvent, CacheKey, CachePayload, CacheResult, EventSource,
    EventType, KeyClass, KeyPolicy, MarketOverview, OrderBookSnapshot, SchemaRegistry, Signal,
    SignalDirection, SignalList, Tier,
};

/// Install logging and, when enabled, the Prometheus recorder from settings.
///
/// Calling it again with new settings only changes the log level.
pub fn init_observability(settings: &Settings) {
    init_tracing_with(&settings.logging);
    if settings.metrics.prometheus {
        crate::metrics::init_metrics();
    }
}

/// Load settings, connect the tiers and start the bridge.
///
/// ## Graceful Degradation
///
/// Unreachable backends do not fail startup: their circuit breakers open and
/// the cache runs on whatever tiers answer, down to the local tier alone.
/// Only invalid configuration is an error.
pub async fn start_bridge(config_path: Option<&str>) -> CacheResult<CacheBridge> {
    let settings = load_settings(config_path)?;
    let bridge = CacheBridge::connect(&settings).await?;
    bridge.start().await?;
    Ok(bridge)
}
