//! Cache metrics: an in-process registry for snapshots plus Prometheus export.
//!
//! Every counter lives in an atomic owned by [`CacheMetrics`] so snapshots
//! and health reports work without a recorder installed. Each update is also
//! forwarded to the `metrics` facade; call [`init_metrics`] once at startup to
//! expose them in Prometheus text format via [`render_metrics`].

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use marketcache_core::{CacheError, EventType, Tier};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::breaker::CircuitState;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Smoothing factor of the latency moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "marketcache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "marketcache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "marketcache_errors_total";
    pub const CACHE_TIMEOUTS_TOTAL: &str = "marketcache_timeouts_total";
    pub const CACHE_FALLBACKS_TOTAL: &str = "marketcache_fallbacks_total";
    pub const CACHE_LATENCY_SECONDS: &str = "marketcache_tier_latency_seconds";
    pub const CROSS_SERVICE_HITS_TOTAL: &str = "marketcache_cross_service_hits_total";
    pub const CACHE_SETS_TOTAL: &str = "marketcache_sets_total";
    pub const LOCAL_EVICTIONS_TOTAL: &str = "marketcache_local_evictions_total";
    pub const LOCAL_ENTRIES: &str = "marketcache_local_entries";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "marketcache_events_published_total";
    pub const EVENTS_RECEIVED_TOTAL: &str = "marketcache_events_received_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "marketcache_events_dropped_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "marketcache_publish_failures_total";
    pub const WARM_CYCLES_TOTAL: &str = "marketcache_warm_cycles_total";
    pub const WARM_DEFAULTS_TOTAL: &str = "marketcache_warm_defaults_total";
    pub const CIRCUIT_STATE: &str = "marketcache_circuit_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn event_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::DataUpdate => "data_update",
        EventType::CacheWarm => "cache_warm",
        EventType::CacheInvalidate => "cache_invalidate",
        EventType::ServiceHeartbeat => "service_heartbeat",
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    /// f64 bits of the latency EWMA in microseconds
    latency_ewma_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl TierCounters {
    fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000_000.0;
        let first = self.latency_samples.fetch_add(1, Ordering::Relaxed) == 0;
        let _ = self
            .latency_ewma_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let next = if first {
                    sample
                } else {
                    LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * f64::from_bits(bits)
                };
                Some(next.to_bits())
            });
    }

    fn stats(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            hit_rate_percent: percent(hits, hits + misses),
            avg_latency_ms: f64::from_bits(self.latency_ewma_us.load(Ordering::Relaxed)) / 1000.0,
        }
    }
}

/// Counters for every tier and for the bridge.
///
/// Global `hits` excludes cross-service hits, so
/// `hits + misses + cross_service_hits` equals the number of lookups.
#[derive(Default)]
pub struct CacheMetrics {
    local: TierCounters,
    fast: TierCounters,
    durable: TierCounters,
    hits: AtomicU64,
    misses: AtomicU64,
    cross_service_hits: AtomicU64,
    sets: AtomicU64,
    sets_soft_failed: AtomicU64,
    sets_rejected: AtomicU64,
    local_evictions: AtomicU64,
    events_published: AtomicU64,
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    publish_failures: AtomicU64,
    warm_cycles: AtomicU64,
    warm_defaults: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: Tier) -> &TierCounters {
        match tier {
            Tier::Local => &self.local,
            Tier::Fast => &self.fast,
            Tier::Durable => &self.durable,
        }
    }

    // -------------------------------------------------------------------------
    // Per-tier
    // -------------------------------------------------------------------------

    pub fn record_tier_hit(&self, tier: Tier, elapsed: Duration) {
        let counters = self.tier(tier);
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(elapsed);
        counter!(names::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
        histogram!(names::CACHE_LATENCY_SECONDS, "tier" => tier.as_str()).record(elapsed.as_secs_f64());
    }

    pub fn record_tier_miss(&self, tier: Tier, elapsed: Duration) {
        let counters = self.tier(tier);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(elapsed);
        counter!(names::CACHE_MISSES_TOTAL, "tier" => tier.as_str()).increment(1);
        histogram!(names::CACHE_LATENCY_SECONDS, "tier" => tier.as_str()).record(elapsed.as_secs_f64());
    }

    /// Latency of a successful call that is neither a hit nor a miss (writes, deletes).
    pub fn record_tier_latency(&self, tier: Tier, elapsed: Duration) {
        self.tier(tier).record_latency(elapsed);
        histogram!(names::CACHE_LATENCY_SECONDS, "tier" => tier.as_str()).record(elapsed.as_secs_f64());
    }

    /// Count a failed backend call. Timeouts are tracked apart from other errors.
    pub fn record_tier_error(&self, tier: Tier, error: &CacheError) {
        let counters = self.tier(tier);
        if error.is_timeout() {
            counters.timeouts.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_TIMEOUTS_TOTAL, "tier" => tier.as_str()).increment(1);
        } else {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_ERRORS_TOTAL, "tier" => tier.as_str()).increment(1);
        }
    }

    /// A tier was skipped (circuit open, error, malformed value) and the lookup moved on.
    pub fn record_fallback(&self, tier: Tier) {
        self.tier(tier).fallbacks.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_FALLBACKS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    pub fn set_circuit_state(&self, tier: Tier, state: CircuitState) {
        gauge!(names::CIRCUIT_STATE, "tier" => tier.as_str()).set(f64::from(state as u8));
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cross_service_hit(&self) {
        self.cross_service_hits.fetch_add(1, Ordering::Relaxed);
        counter!(names::CROSS_SERVICE_HITS_TOTAL).increment(1);
    }

    pub fn cross_service_hits(&self) -> u64 {
        self.cross_service_hits.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Writes and local tier
    // -------------------------------------------------------------------------

    pub fn record_set_accepted(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SETS_TOTAL, "outcome" => "accepted").increment(1);
    }

    /// Only the local tier kept the value.
    pub fn record_set_soft_failed(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.sets_soft_failed.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SETS_TOTAL, "outcome" => "local_only").increment(1);
    }

    /// Invalid key, TTL or payload; nothing was written.
    pub fn record_set_rejected(&self) {
        self.sets_rejected.fetch_add(1, Ordering::Relaxed);
        counter!(names::CACHE_SETS_TOTAL, "outcome" => "rejected").increment(1);
    }

    pub fn record_eviction(&self) {
        self.local_evictions.fetch_add(1, Ordering::Relaxed);
        counter!(names::LOCAL_EVICTIONS_TOTAL).increment(1);
    }

    pub fn set_local_entries(&self, count: usize) {
        gauge!(names::LOCAL_ENTRIES).set(count as f64);
    }

    // -------------------------------------------------------------------------
    // Bridge
    // -------------------------------------------------------------------------

    pub fn record_event_published(&self, event_type: EventType) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVENTS_PUBLISHED_TOTAL, "type" => event_label(event_type)).increment(1);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
    }

    pub fn record_event_received(&self, event_type: EventType) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVENTS_RECEIVED_TOTAL, "type" => event_label(event_type)).increment(1);
    }

    /// Undecodable or rejected event.
    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
    }

    pub fn record_warm_cycle(&self) {
        self.warm_cycles.fetch_add(1, Ordering::Relaxed);
        counter!(names::WARM_CYCLES_TOTAL).increment(1);
    }

    pub fn record_warm_default(&self) {
        self.warm_defaults.fetch_add(1, Ordering::Relaxed);
        counter!(names::WARM_DEFAULTS_TOTAL).increment(1);
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Cross-service hits as a percentage of all lookups.
    pub fn cross_service_hit_rate_percent(&self) -> f64 {
        let cross = self.cross_service_hits.load(Ordering::Relaxed);
        let total = self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed) + cross;
        percent(cross, total)
    }

    pub fn snapshot<I>(&self, breakers: I) -> MetricsSnapshot
    where
        I: IntoIterator<Item = (Tier, CircuitState)>,
    {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let cross_service_hits = self.cross_service_hits.load(Ordering::Relaxed);
        let lookups = hits + misses + cross_service_hits;

        MetricsSnapshot {
            tiers: TierSnapshots {
                local: self.local.stats(),
                fast: self.fast.stats(),
                durable: self.durable.stats(),
            },
            lookups,
            hits,
            misses,
            cross_service_hits,
            hit_rate_percent: percent(hits + cross_service_hits, lookups),
            cross_service_hit_rate_percent: percent(cross_service_hits, lookups),
            sets: self.sets.load(Ordering::Relaxed),
            sets_soft_failed: self.sets_soft_failed.load(Ordering::Relaxed),
            sets_rejected: self.sets_rejected.load(Ordering::Relaxed),
            local_evictions: self.local_evictions.load(Ordering::Relaxed),
            events: EventStats {
                published: self.events_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                received: self.events_received.load(Ordering::Relaxed),
                dropped: self.events_dropped.load(Ordering::Relaxed),
            },
            warming: WarmStats {
                cycles: self.warm_cycles.load(Ordering::Relaxed),
                defaults_published: self.warm_defaults.load(Ordering::Relaxed),
            },
            circuit_breakers: breakers
                .into_iter()
                .map(|(tier, state)| (tier.as_str(), state))
                .collect(),
        }
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .field("cross_service_hits", &self.cross_service_hits.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub hit_rate_percent: f64,
    /// Exponentially weighted moving average
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierSnapshots {
    pub local: TierStats,
    pub fast: TierStats,
    pub durable: TierStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmStats {
    pub cycles: u64,
    pub defaults_published: u64,
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tiers: TierSnapshots,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub cross_service_hits: u64,
    pub hit_rate_percent: f64,
    pub cross_service_hit_rate_percent: f64,
    pub sets: u64,
    pub sets_soft_failed: u64,
    pub sets_rejected: u64,
    pub local_evictions: u64,
    pub events: EventStats,
    pub warming: WarmStats,
    pub circuit_breakers: BTreeMap<&'static str, CircuitState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_reports_zero_rates() {
        let metrics = CacheMetrics::new();
        let snapshot = metrics.snapshot([(Tier::Fast, CircuitState::Closed)]);

        assert_eq!(snapshot.lookups, 0);
        assert_eq!(snapshot.cross_service_hit_rate_percent, 0.0);
        assert_eq!(snapshot.circuit_breakers.get("fast"), Some(&CircuitState::Closed));

        // The cross-service figure must be present even when it is zero.
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cross_service_hits"], 0);
        assert_eq!(json["cross_service_hit_rate_percent"], 0.0);
    }

    #[test]
    fn test_cross_service_rate() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_cross_service_hit();
        metrics.record_cross_service_hit();

        assert!((metrics.cross_service_hit_rate_percent() - 50.0).abs() < 1e-9);
        let snapshot = metrics.snapshot([]);
        assert_eq!(snapshot.lookups, 4);
        assert!((snapshot.hit_rate_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeouts_tracked_apart_from_errors() {
        let metrics = CacheMetrics::new();
        metrics.record_tier_error(
            Tier::Durable,
            &CacheError::Timeout {
                tier: Tier::Durable,
                after: Duration::from_millis(10),
            },
        );
        metrics.record_tier_error(Tier::Durable, &CacheError::unavailable(Tier::Durable, "down"));

        let stats = metrics.snapshot([]).tiers.durable;
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_latency_ewma() {
        let metrics = CacheMetrics::new();
        metrics.record_tier_hit(Tier::Fast, Duration::from_millis(10));
        assert!((metrics.snapshot([]).tiers.fast.avg_latency_ms - 10.0).abs() < 1e-6);

        metrics.record_tier_hit(Tier::Fast, Duration::from_millis(20));
        // 0.2 * 20 + 0.8 * 10
        assert!((metrics.snapshot([]).tiers.fast.avg_latency_ms - 12.0).abs() < 1e-6);
    }
}
