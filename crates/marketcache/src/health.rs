//! Health checks: one synthetic write + read per tier.
//!
//! Probes go straight to the backend client (bypassing the circuit breaker)
//! so an open breaker does not hide a recovered service. The report carries
//! the breaker state separately.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use marketcache_core::{CacheError, EventSource, from_unix_millis, unix_millis_now};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::backend::GuardedBackend;
use crate::breaker::CircuitState;
use crate::config::HealthConfig;
use crate::metrics::MetricsSnapshot;
use crate::tiered::TieredCache;

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Status of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierStatus {
    Healthy,
    /// Reachable but slow, inconsistent or behind an open breaker
    Degraded,
    Unreachable,
    Disabled,
}

impl TierStatus {
    fn is_reachable(&self) -> bool {
        matches!(self, TierStatus::Healthy | TierStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierHealth {
    pub status: TierStatus,
    /// Probe round trip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TierHealth {
    fn disabled() -> Self {
        Self {
            status: TierStatus::Disabled,
            latency_ms: None,
            circuit: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierHealthReport {
    pub local: TierHealth,
    pub fast: TierHealth,
    pub durable: TierHealth,
}

/// Last heartbeat per role, RFC 3339.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LastSeen {
    pub producer: Option<String>,
    pub consumer: Option<String>,
    pub warmer: Option<String>,
}

impl LastSeen {
    pub fn from_millis(last_seen: &BTreeMap<EventSource, i64>) -> Self {
        let format = |role: EventSource| {
            last_seen
                .get(&role)
                .and_then(|ms| from_unix_millis(*ms).format(&Rfc3339).ok())
        };
        Self {
            producer: format(EventSource::Producer),
            consumer: format(EventSource::Consumer),
            warmer: format(EventSource::Warmer),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub process_id: String,
    pub tiers: TierHealthReport,
    pub cross_service_hit_rate_percent: f64,
    pub services_connected: Vec<EventSource>,
    pub last_seen: LastSeen,
    pub metrics: MetricsSnapshot,
}

impl HealthReport {
    /// Probe every tier of `cache` and assemble the report.
    pub async fn collect(
        cache: &TieredCache,
        config: &HealthConfig,
        services_connected: Vec<EventSource>,
        last_seen: LastSeen,
    ) -> Self {
        let probe_key = format!("system:health_probe:{}", cache.process_id());
        let (fast, durable) = tokio::join!(
            probe(cache.fast(), &probe_key, config),
            probe(cache.durable(), &probe_key, config),
        );
        let local = probe_local(cache);
        let status = overall_status(&fast, &durable);

        if status != HealthStatus::Healthy {
            tracing::warn!(
                status = status.as_str(),
                fast = ?fast.status,
                durable = ?durable.status,
                "cache health check"
            );
        }

        let metrics = cache.snapshot();
        Self {
            status,
            process_id: cache.process_id().to_string(),
            tiers: TierHealthReport { local, fast, durable },
            cross_service_hit_rate_percent: metrics.cross_service_hit_rate_percent,
            services_connected,
            last_seen,
            metrics,
        }
    }
}

/// Healthy when every enabled shared tier is healthy, unhealthy when none is
/// reachable. A deployment without shared tiers is degraded: it serves
/// reads but shares nothing.
pub fn overall_status(fast: &TierHealth, durable: &TierHealth) -> HealthStatus {
    let enabled: Vec<&TierHealth> = [fast, durable]
        .into_iter()
        .filter(|tier| tier.status != TierStatus::Disabled)
        .collect();

    if enabled.is_empty() {
        HealthStatus::Degraded
    } else if enabled.iter().all(|tier| tier.status == TierStatus::Healthy) {
        HealthStatus::Healthy
    } else if enabled.iter().any(|tier| tier.status.is_reachable()) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// The local tier is probed without inserting: a write into a full LRU
/// would evict a live entry.
fn probe_local(cache: &TieredCache) -> TierHealth {
    let started = Instant::now();
    let (len, capacity, purged) = cache.local().inspect();
    cache.metrics().set_local_entries(len);

    TierHealth {
        status: if len <= capacity { TierStatus::Healthy } else { TierStatus::Degraded },
        latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
        circuit: None,
        detail: Some(format!("{len}/{capacity} entries, {purged} expired purged")),
    }
}

async fn probe(backend: Option<&GuardedBackend>, probe_key: &str, config: &HealthConfig) -> TierHealth {
    let Some(backend) = backend else {
        return TierHealth::disabled();
    };
    let client = backend.client();
    let circuit = backend.circuit_state();
    let marker = unix_millis_now().to_string();
    let ttl = Duration::from_secs(config.probe_ttl_secs);

    let started = Instant::now();
    let round_trip = async {
        client.set(probe_key, marker.as_bytes(), ttl).await?;
        let read = client.get(probe_key).await?;
        Ok::<_, CacheError>(read)
    };
    let result = tokio::time::timeout(backend.timeout() * 2, round_trip).await;
    let latency = started.elapsed();
    let latency_ms = Some(latency.as_secs_f64() * 1000.0);

    let (status, detail) = match result {
        Err(_) => (
            TierStatus::Unreachable,
            Some(format!("probe timed out after {:?}", backend.timeout() * 2)),
        ),
        Ok(Err(e)) => (TierStatus::Unreachable, Some(e.to_string())),
        Ok(Ok(read)) if read.as_deref() != Some(marker.as_bytes()) => {
            (TierStatus::Degraded, Some("probe value not read back".to_string()))
        }
        Ok(Ok(_)) if latency > Duration::from_millis(config.slow_probe_ms) => {
            (TierStatus::Degraded, Some(format!("slow probe ({latency:?})")))
        }
        Ok(Ok(_)) if circuit != CircuitState::Closed => {
            (TierStatus::Degraded, Some(format!("circuit {}", circuit.as_str())))
        }
        Ok(Ok(_)) => (TierStatus::Healthy, None),
    };
    let detail = match (detail, client.pool_detail()) {
        (Some(detail), Some(pool)) => Some(format!("{detail}; {pool}")),
        (detail, pool) => detail.or(pool),
    };

    tracing::debug!(tier = %backend.tier(), status = ?status, ?latency, "health probe");
    TierHealth {
        status,
        latency_ms,
        circuit: Some(circuit),
        detail,
    }
}
