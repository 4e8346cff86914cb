//! Three-tier cache orchestrator.
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get ──► Local (LRU) ──► Fast (shared, volatile) ──► Durable (shared, persistent)
//!            hit: return      hit: promote to Local      hit: promote to Local,
//!                                                         repopulate Fast (best effort)
//! ```
//!
//! `set` writes Local synchronously, then Fast and Durable concurrently and
//! independently through their circuit breakers (write-through, no queued
//! retries). A write that no shared tier accepted stays visible to this
//! process only and is reported as a soft failure.
//!
//! ## Graceful Degradation
//!
//! Backend failures are logged and counted, never returned from `get`. With
//! every shared tier down each `get` of a key not held locally is a miss and
//! each `set` is local-only. This component never synthesizes data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marketcache_core::{
    CacheEntry, CacheError, CacheKey, CacheResult, KeyClass, KeyPolicy, MAX_TTL, SchemaRegistry,
    StoredValue, Tier, unix_millis_now,
};

use crate::backend::{BackendClient, GuardedBackend, connect_backend};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::{BreakerConfig, LocalTierConfig, Settings};
use crate::local::{LocalInsert, LocalTier};
use crate::metrics::{CacheMetrics, MetricsSnapshot};

/// Outcome of a write on one shared tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierWrite {
    Written,
    /// Circuit open, the backend was not called
    Skipped,
    Failed(String),
    /// Tier not configured
    Disabled,
}

impl TierWrite {
    pub fn is_written(&self) -> bool {
        matches!(self, TierWrite::Written)
    }
}

/// Per-tier result of `set` / `invalidate`. The local tier always succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub fast: TierWrite,
    pub durable: TierWrite,
}

impl WriteReport {
    /// At least one shared tier took the write.
    pub fn accepted(&self) -> bool {
        self.fast.is_written() || self.durable.is_written()
    }

    /// Only the local tier holds the value.
    pub fn local_only(&self) -> bool {
        !self.accepted()
    }
}

/// Identifier for this process: `<hostname>-<pid>-<random>`.
pub fn generate_process_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

pub struct TieredCache {
    local: LocalTier,
    fast: Option<GuardedBackend>,
    durable: Option<GuardedBackend>,
    local_config: LocalTierConfig,
    policy: KeyPolicy,
    schemas: SchemaRegistry,
    metrics: Arc<CacheMetrics>,
    process_id: String,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Build from settings, connecting the enabled shared tiers.
    ///
    /// Fails only on invalid configuration; unreachable backends are left to
    /// their circuit breakers.
    pub async fn from_settings(settings: &Settings) -> CacheResult<Self> {
        settings.validate()?;

        let mut builder = Self::builder()
            .local_config(settings.local.clone())
            .breaker_config(settings.breaker.clone())
            .key_policy(settings.keys.policy()?);

        if let Some(fast) = connect_backend(Tier::Fast, &settings.fast).await {
            builder = builder.fast(fast, settings.fast.timeout());
        }
        if let Some(durable) = connect_backend(Tier::Durable, &settings.durable).await {
            builder = builder.durable(durable, settings.durable.timeout());
        }
        builder.build()
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn fast(&self) -> Option<&GuardedBackend> {
        self.fast.as_ref()
    }

    pub fn durable(&self) -> Option<&GuardedBackend> {
        self.durable.as_ref()
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Local-tier TTL for a key class.
    pub fn local_ttl(&self, class: KeyClass) -> Duration {
        self.local_config.ttl_for(class)
    }

    pub fn circuit_states(&self) -> Vec<(Tier, CircuitState)> {
        [self.fast.as_ref(), self.durable.as_ref()]
            .into_iter()
            .flatten()
            .map(|backend| (backend.tier(), backend.circuit_state()))
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.circuit_states())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Look a key up through every tier.
    ///
    /// A hit on a shared tier for a cross-process key counts as a
    /// cross-service hit instead of an ordinary hit.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let key = match CacheKey::parse(key) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "lookup with invalid key");
                self.metrics.record_miss();
                return None;
            }
        };

        let started = Instant::now();
        if let Some(entry) = self.local.get(key.as_str()) {
            tracing::debug!(key = %key, "cache hit (local)");
            self.metrics.record_tier_hit(Tier::Local, started.elapsed());
            self.metrics.record_hit();
            return Some(entry);
        }
        self.metrics.record_tier_miss(Tier::Local, started.elapsed());

        let class = self.policy.classify(&key);
        let found = self.lookup_shared(&key, class).await;
        match &found {
            Some(entry) if class == KeyClass::CrossProcess => {
                tracing::debug!(key = %key, tier = %entry.origin, "cross-service hit");
                self.metrics.record_cross_service_hit();
            }
            Some(entry) => {
                tracing::debug!(key = %key, tier = %entry.origin, "cache hit");
                self.metrics.record_hit();
            }
            None => {
                tracing::debug!(key = %key, "cache miss");
                self.metrics.record_miss();
            }
        }
        found
    }

    /// Same lookup as [`get`](Self::get) but skipping the local tier and the
    /// global hit/miss accounting. Used for maintenance reads such as warming.
    pub async fn get_shared(&self, key: &str) -> Option<CacheEntry> {
        let key = CacheKey::parse(key).ok()?;
        let class = self.policy.classify(&key);
        self.lookup_shared(&key, class).await
    }

    async fn lookup_shared(&self, key: &CacheKey, class: KeyClass) -> Option<CacheEntry> {
        if let Some(fast) = &self.fast {
            if let Some((stored, _)) = self.read_tier(fast, key).await {
                return self.promote(key, class, stored, Tier::Fast);
            }
        }

        if let Some(durable) = &self.durable {
            if let Some((stored, raw)) = self.read_tier(durable, key).await {
                let entry = self.promote(key, class, stored, Tier::Durable)?;
                if let Some(fast) = &self.fast {
                    if let Err(e) = fast.set(key.as_str(), &raw, entry.ttl).await {
                        tracing::debug!(key = %key, error = %e, "fast tier repopulation skipped");
                    }
                }
                return Some(entry);
            }
        }

        None
    }

    /// Read and decode one shared tier. Malformed values count as tier errors.
    async fn read_tier(
        &self,
        backend: &GuardedBackend,
        key: &CacheKey,
    ) -> Option<(StoredValue, Vec<u8>)> {
        let tier = backend.tier();
        let (raw, elapsed) = match backend.get(key.as_str()).await {
            Ok((Some(raw), elapsed)) => (raw, elapsed),
            Ok((None, elapsed)) => {
                self.metrics.record_tier_miss(tier, elapsed);
                return None;
            }
            Err(_) => {
                // Counted and logged by the guard.
                self.metrics.record_fallback(tier);
                return None;
            }
        };

        let decoded = StoredValue::decode(&raw).and_then(|stored| {
            self.schemas.validate(key, &stored.payload)?;
            Ok(stored)
        });
        match decoded {
            Ok(stored) if stored.remaining_ttl(unix_millis_now()).is_some() => {
                self.metrics.record_tier_hit(tier, elapsed);
                Some((stored, raw))
            }
            Ok(_) => {
                // Producer TTL elapsed but the backend still returned it.
                self.metrics.record_tier_miss(tier, elapsed);
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, tier = %tier, error = %e, "discarding malformed cached value");
                self.metrics.record_tier_error(tier, &e);
                self.metrics.record_fallback(tier);
                None
            }
        }
    }

    /// Copy a shared-tier value into the local tier without outliving its producer TTL.
    fn promote(
        &self,
        key: &CacheKey,
        class: KeyClass,
        stored: StoredValue,
        origin: Tier,
    ) -> Option<CacheEntry> {
        let remaining = stored.remaining_ttl(unix_millis_now())?;
        let local_ttl = self.local_ttl(class).min(remaining);
        let outcome = self.local.set_if_newer(
            key.as_str(),
            Arc::clone(&stored.payload),
            local_ttl,
            stored.written_at_ms,
            Some(stored.writer.clone()),
        );
        self.note_local_insert(outcome);
        Some(stored.into_entry(key.as_str(), origin, remaining))
    }

    fn note_local_insert(&self, outcome: LocalInsert) {
        if let LocalInsert::Evicted(evicted) = outcome {
            tracing::debug!(key = %evicted, "local tier evicted least recently used entry");
            self.metrics.record_eviction();
        }
        self.metrics.set_local_entries(self.local.len());
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write through every tier.
    ///
    /// Errors are returned only for writes that were rejected outright
    /// (invalid key, zero TTL, malformed payload). Backend failures are
    /// reported in the [`WriteReport`].
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<WriteReport> {
        let (key, stored, envelope) = match self.prepare_write(key, value, ttl) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "write rejected");
                self.metrics.record_set_rejected();
                return Err(e);
            }
        };

        // Local first, synchronously: a following get in this process sees the value.
        let class = self.policy.classify(&key);
        let outcome = self.local.set_written(
            key.as_str(),
            Arc::clone(&stored.payload),
            self.local_ttl(class).min(ttl),
            stored.written_at_ms,
            Some(self.process_id.clone()),
        );
        self.note_local_insert(outcome);

        let (fast, durable) = tokio::join!(
            Self::write_tier(self.fast.as_ref(), key.as_str(), &envelope, ttl),
            Self::write_tier(self.durable.as_ref(), key.as_str(), &envelope, ttl),
        );
        let report = WriteReport { fast, durable };

        if report.accepted() {
            tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cache set");
            self.metrics.record_set_accepted();
        } else {
            tracing::warn!(key = %key, ?report, "no shared tier accepted the write, value is local only");
            self.metrics.record_set_soft_failed();
        }
        Ok(report)
    }

    fn prepare_write(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> CacheResult<(CacheKey, StoredValue, Vec<u8>)> {
        let key = CacheKey::parse(key)?;
        if ttl.is_zero() {
            return Err(CacheError::invalid_payload(key.as_str(), "ttl must be greater than zero"));
        }
        if ttl > MAX_TTL {
            return Err(CacheError::invalid_payload(
                key.as_str(),
                format!("ttl exceeds the maximum of {}s", MAX_TTL.as_secs()),
            ));
        }
        self.schemas.validate(&key, &value)?;
        let stored = StoredValue::new(self.process_id.as_str(), Arc::new(value), ttl);
        let envelope = stored.encode()?;
        Ok((key, stored, envelope))
    }

    async fn write_tier(
        backend: Option<&GuardedBackend>,
        key: &str,
        envelope: &[u8],
        ttl: Duration,
    ) -> TierWrite {
        let Some(backend) = backend else {
            return TierWrite::Disabled;
        };
        match backend.set(key, envelope, ttl).await {
            Ok(()) => TierWrite::Written,
            Err(CacheError::CircuitOpen { .. }) => TierWrite::Skipped,
            Err(e) => TierWrite::Failed(e.to_string()),
        }
    }

    /// Accept a value written by another process (delivered over pub/sub).
    ///
    /// Only the local tier is touched; the TTL is the class TTL bounded by
    /// the producer TTL (a zero `ttl` means unbounded), and a newer local
    /// value is kept.
    pub fn accept_remote(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        written_at_ms: i64,
        writer: &str,
    ) -> CacheResult<LocalInsert> {
        let key = CacheKey::parse(key)?;
        self.schemas.validate(&key, payload)?;

        let class = self.policy.classify(&key);
        let mut local_ttl = self.local_ttl(class);
        if !ttl.is_zero() {
            // The event may have spent time in flight.
            let elapsed_ms = u64::try_from(unix_millis_now().saturating_sub(written_at_ms)).unwrap_or(0);
            let remaining = ttl.min(MAX_TTL).saturating_sub(Duration::from_millis(elapsed_ms));
            if remaining.is_zero() {
                return Ok(LocalInsert::Stale);
            }
            local_ttl = local_ttl.min(remaining);
        }

        let outcome = self.local.set_if_newer(
            key.as_str(),
            Arc::new(payload.to_vec()),
            local_ttl,
            written_at_ms,
            Some(writer.to_string()),
        );
        self.note_local_insert(outcome.clone());
        Ok(outcome)
    }

    /// Remove a key from every tier.
    pub async fn invalidate(&self, key: &str) -> CacheResult<WriteReport> {
        let key = CacheKey::parse(key)?;
        self.local.remove(key.as_str());

        let (fast, durable) = tokio::join!(
            Self::delete_tier(self.fast.as_ref(), key.as_str()),
            Self::delete_tier(self.durable.as_ref(), key.as_str()),
        );
        tracing::debug!(key = %key, "cache invalidated");
        Ok(WriteReport { fast, durable })
    }

    async fn delete_tier(backend: Option<&GuardedBackend>, key: &str) -> TierWrite {
        let Some(backend) = backend else {
            return TierWrite::Disabled;
        };
        match backend.delete(key).await {
            Ok(()) => TierWrite::Written,
            Err(CacheError::CircuitOpen { .. }) => TierWrite::Skipped,
            Err(e) => TierWrite::Failed(e.to_string()),
        }
    }

    /// Drop a key from the local tier only.
    pub fn evict_local(&self, key: &str) -> bool {
        let removed = self.local.remove(key);
        self.metrics.set_local_entries(self.local.len());
        removed
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("process_id", &self.process_id)
            .field("local", &self.local)
            .field("fast", &self.fast)
            .field("durable", &self.durable)
            .finish()
    }
}

/// Builder for [`TieredCache`].
#[derive(Default)]
pub struct TieredCacheBuilder {
    local_config: Option<LocalTierConfig>,
    breaker_config: Option<BreakerConfig>,
    policy: Option<KeyPolicy>,
    schemas: Option<SchemaRegistry>,
    fast: Option<(Arc<dyn BackendClient>, Duration)>,
    durable: Option<(Arc<dyn BackendClient>, Duration)>,
    metrics: Option<Arc<CacheMetrics>>,
    process_id: Option<String>,
}

impl TieredCacheBuilder {
    pub fn local_config(mut self, config: LocalTierConfig) -> Self {
        self.local_config = Some(config);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }

    pub fn key_policy(mut self, policy: KeyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Replace the default schema registry.
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn fast(mut self, client: Arc<dyn BackendClient>, timeout: Duration) -> Self {
        self.fast = Some((client, timeout));
        self
    }

    pub fn durable(mut self, client: Arc<dyn BackendClient>, timeout: Duration) -> Self {
        self.durable = Some((client, timeout));
        self
    }

    pub fn metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn build(self) -> CacheResult<TieredCache> {
        let local_config = self.local_config.unwrap_or_default();
        if local_config.local_ttl_secs == 0 || local_config.cross_process_ttl_secs == 0 {
            return Err(CacheError::configuration("local tier TTLs must be > 0"));
        }
        let local = LocalTier::new(local_config.max_entries)?;
        let breaker_config = self.breaker_config.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_default();

        let guard = |(client, timeout): (Arc<dyn BackendClient>, Duration)| -> CacheResult<GuardedBackend> {
            if timeout.is_zero() {
                return Err(CacheError::configuration(format!(
                    "{} tier timeout must be > 0",
                    client.tier()
                )));
            }
            let breaker = CircuitBreaker::from_config(client.tier(), &breaker_config);
            Ok(GuardedBackend::new(client, breaker, timeout, Arc::clone(&metrics)))
        };
        let fast = self.fast.map(&guard).transpose()?;
        let durable = self.durable.map(&guard).transpose()?;

        for (backend, expected) in [(&fast, Tier::Fast), (&durable, Tier::Durable)] {
            if let Some(backend) = backend {
                if backend.tier() != expected {
                    return Err(CacheError::configuration(format!(
                        "{} backend configured as {expected} tier",
                        backend.tier()
                    )));
                }
            }
        }

        Ok(TieredCache {
            local,
            fast,
            durable,
            local_config,
            policy: self.policy.unwrap_or_default(),
            schemas: self.schemas.unwrap_or_else(SchemaRegistry::with_defaults),
            metrics,
            process_id: self.process_id.unwrap_or_else(generate_process_id),
        })
    }
}
