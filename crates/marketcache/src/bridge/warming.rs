//! Cache warming for critical keys.
//!
//! Once at startup and then on every interval, each critical key is looked
//! up in the shared tiers. A key nobody has written yet gets a safe default
//! published with a short TTL, so consumers never see a hard miss for it.
//! A real producer write replaces the default on its next run.

use std::sync::Arc;

use marketcache_core::{CacheEvent, CacheKey, CacheResult, SchemaRegistry};
use tokio_util::sync::CancellationToken;

use super::BridgeInner;

/// Source of placeholder values for critical keys nobody has written.
pub trait DefaultValueProvider: Send + Sync {
    /// JSON payload for `key`, or `None` when no safe default exists.
    fn default_value(&self, key: &CacheKey) -> Option<CacheResult<Vec<u8>>>;
}

/// Empty but valid values for every key with a registered schema.
#[derive(Debug, Clone)]
pub struct SchemaDefaults {
    schemas: SchemaRegistry,
}

impl SchemaDefaults {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }
}

impl Default for SchemaDefaults {
    fn default() -> Self {
        Self::new(SchemaRegistry::with_defaults())
    }
}

impl DefaultValueProvider for SchemaDefaults {
    fn default_value(&self, key: &CacheKey) -> Option<CacheResult<Vec<u8>>> {
        self.schemas.safe_default(key)
    }
}

/// Outcome of one warming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    /// Keys already present in a shared tier
    pub present: Vec<String>,
    /// Keys that received a default
    pub warmed: Vec<String>,
    /// Keys left absent (no default, or the write was not accepted)
    pub failed: Vec<String>,
}

/// Check every critical key once.
pub(super) async fn warm_once(inner: &BridgeInner) -> WarmReport {
    let cache = &inner.cache;
    let mut report = WarmReport::default();

    for raw in &inner.config.critical_keys {
        if cache.get_shared(raw).await.is_some() {
            report.present.push(raw.clone());
            continue;
        }

        let key = match CacheKey::parse(raw) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(key = %raw, error = %e, "skipping invalid critical key");
                report.failed.push(raw.clone());
                continue;
            }
        };
        let payload = match inner.defaults.default_value(&key) {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                tracing::warn!(key = %key, error = %e, "safe default is invalid");
                report.failed.push(raw.clone());
                continue;
            }
            None => {
                tracing::warn!(key = %key, "critical key is absent and has no safe default");
                report.failed.push(raw.clone());
                continue;
            }
        };

        let ttl = inner.config.warm_ttl();
        match cache.set(key.as_str(), payload.clone(), ttl).await {
            Ok(write) if write.accepted() => {
                tracing::info!(key = %key, ttl_secs = ttl.as_secs(), "warmed critical key with safe default");
                cache.metrics().record_warm_default();
                if let Ok(event) = CacheEvent::cache_warm(key.as_str(), &payload, ttl, cache.process_id()) {
                    inner.publish_event(&event).await;
                }
                report.warmed.push(raw.clone());
            }
            Ok(_) => report.failed.push(raw.clone()),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to warm critical key");
                report.failed.push(raw.clone());
            }
        }
    }

    cache.metrics().record_warm_cycle();
    tracing::debug!(
        present = report.present.len(),
        warmed = report.warmed.len(),
        failed = report.failed.len(),
        "warming cycle complete"
    );
    report
}

/// Warm on every interval until cancelled. The startup pass runs in `CacheBridge::start`.
pub(super) async fn run(inner: Arc<BridgeInner>, cancel: CancellationToken) {
    let interval = inner.config.warm_interval();
    tracing::info!(interval_secs = interval.as_secs(), "warming loop started");

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                warm_once(&inner).await;
            }
        }
    }
    tracing::info!("warming loop stopped");
}
