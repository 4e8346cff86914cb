//! Cross-process bridge.
//!
//! ## Architecture
//!
//! ```text
//!  producer process                         consumer process
//! ┌──────────────────┐                     ┌──────────────────┐
//! │ bridge.publish() │                     │ bridge.get()     │
//! │   TieredCache.set│──► fast/durable ◄───│   TieredCache.get│
//! │   DATA_UPDATE ───┼──► channel ────────►│ listener → local │
//! └──────────────────┘                     └──────────────────┘
//! ```
//!
//! The durable tier is the source of truth. Events on the channel are
//! best-effort and at-most-once; they only shorten the time a consumer
//! serves a value from its local tier. Correctness never depends on them.
//!
//! A bridge is constructed explicitly by the hosting application and owns
//! three background tasks once started: the event listener, the warming loop
//! and the heartbeat loop.

pub mod heartbeat;
pub mod listener;
pub mod warming;

pub use heartbeat::PeerRegistry;
pub use listener::EventOutcome;
pub use warming::{DefaultValueProvider, SchemaDefaults, WarmReport};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use marketcache_core::{
    CacheEntry, CacheError, CacheEvent, CachePayload, CacheResult, EventSource, unix_millis_now,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::GuardedBackend;
use crate::config::{BridgeConfig, HealthConfig, Settings};
use crate::health::{HealthReport, LastSeen};
use crate::metrics::MetricsSnapshot;
use crate::tiered::{TieredCache, WriteReport};

/// State shared with the background tasks.
pub(crate) struct BridgeInner {
    pub(crate) cache: Arc<TieredCache>,
    pub(crate) config: BridgeConfig,
    pub(crate) health: HealthConfig,
    pub(crate) defaults: Arc<dyn DefaultValueProvider>,
    pub(crate) peers: PeerRegistry,
}

impl BridgeInner {
    /// Tier carrying the event channel: durable when configured, else fast.
    fn event_bus(&self) -> Option<&GuardedBackend> {
        self.cache.durable().or(self.cache.fast())
    }

    /// Best-effort publish. Failures are counted and logged, never returned.
    pub(crate) async fn publish_event(&self, event: &CacheEvent) -> bool {
        let metrics = self.cache.metrics();
        let Some(bus) = self.event_bus() else {
            return false;
        };

        let message = match event.to_bytes() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(key = %event.key, error = %e, "failed to encode cache event");
                metrics.record_publish_failure();
                return false;
            }
        };

        match bus.publish(&self.config.channel, &message).await {
            Ok(()) => {
                tracing::debug!(event_type = ?event.event_type, key = %event.key, "published cache event");
                metrics.record_event_published(event.event_type);
                true
            }
            Err(e) => {
                tracing::debug!(event_type = ?event.event_type, key = %event.key, error = %e, "cache event not published");
                metrics.record_publish_failure();
                false
            }
        }
    }
}

/// Cross-process cache bridge.
pub struct CacheBridge {
    inner: Arc<BridgeInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CacheBridge {
    /// Bridge over `cache` using the `bridge` and `health` sections of `settings`.
    pub fn new(settings: &Settings, cache: Arc<TieredCache>) -> CacheResult<Self> {
        settings.validate()?;
        Self::builder(cache)
            .config(settings.bridge.clone())
            .health_config(settings.health.clone())
            .build()
    }

    /// Build the tiered cache and the bridge from settings.
    pub async fn connect(settings: &Settings) -> CacheResult<Self> {
        let cache = TieredCache::from_settings(settings).await?;
        Self::new(settings, Arc::new(cache))
    }

    pub fn builder(cache: Arc<TieredCache>) -> CacheBridgeBuilder {
        CacheBridgeBuilder {
            cache,
            config: None,
            health: None,
            defaults: None,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    pub fn process_id(&self) -> &str {
        self.inner.cache.process_id()
    }

    pub fn role(&self) -> EventSource {
        self.inner.config.role
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    // -------------------------------------------------------------------------
    // Data path
    // -------------------------------------------------------------------------

    /// Write through every tier, then announce the update on the channel.
    ///
    /// The announcement is best-effort: a lost or failed publish is logged
    /// and counted but does not fail the call.
    pub async fn publish(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        source: EventSource,
    ) -> CacheResult<WriteReport> {
        let report = self.inner.cache.set(key, value.clone(), ttl).await?;

        match CacheEvent::data_update(key, &value, ttl, source, self.process_id()) {
            Ok(event) => {
                self.inner.publish_event(&event).await;
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "failed to build update event"),
        }
        Ok(report)
    }

    /// Validate, serialize and [`publish`](Self::publish) a typed payload.
    pub async fn publish_typed<T: CachePayload>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        source: EventSource,
    ) -> CacheResult<WriteReport> {
        let payload = value.to_payload(key)?;
        self.publish(key, payload, ttl, source).await
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.cache.get(key).await
    }

    /// Look up and decode a typed payload. Values that fail validation read as a miss.
    pub async fn get_typed<T: CachePayload>(&self, key: &str) -> Option<T> {
        let entry = self.inner.cache.get(key).await?;
        match T::from_payload(key, &entry.value) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cached value does not match its schema");
                None
            }
        }
    }

    /// Remove a key from every tier and tell the other processes to drop it.
    pub async fn invalidate(&self, key: &str) -> CacheResult<WriteReport> {
        let report = self.inner.cache.invalidate(key).await?;
        let event = CacheEvent::invalidate(key, self.role(), self.process_id());
        self.inner.publish_event(&event).await;
        Ok(report)
    }

    /// Apply an event as if it came from the channel.
    pub fn handle_event(&self, event: &CacheEvent) -> EventOutcome {
        listener::handle_event(&self.inner, event)
    }

    /// Run one warming pass now.
    pub async fn warm_now(&self) -> WarmReport {
        warming::warm_once(&self.inner).await
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Warm critical keys once, then spawn the listener, warming and heartbeat tasks.
    ///
    /// Calling `start` again is a no-op; a bridge cannot be restarted after
    /// [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> CacheResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CacheError::configuration("bridge has been shut down"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("cache bridge already started");
            return Ok(());
        }

        tracing::info!(
            process_id = %self.process_id(),
            role = %self.role(),
            channel = %self.inner.config.channel,
            "starting cache bridge"
        );

        let mut tasks = Vec::with_capacity(3);
        match self.inner.event_bus() {
            Some(bus) => tasks.push(tokio::spawn(listener::run(
                Arc::clone(&self.inner),
                Arc::clone(bus.client()),
                self.cancel.child_token(),
            ))),
            None => tracing::warn!("no shared tier configured, event listener not started"),
        }

        self.warm_now().await;

        tasks.push(tokio::spawn(warming::run(
            Arc::clone(&self.inner),
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(heartbeat::run(
            Arc::clone(&self.inner),
            self.cancel.child_token(),
        )));
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "cache bridge task ended abnormally");
            }
        }
        tracing::info!(process_id = %self.process_id(), "cache bridge stopped");
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    /// Roles seen within the peer timeout, this process included.
    pub fn services_connected(&self) -> Vec<EventSource> {
        let mut roles = self.inner.peers.connected_roles(self.inner.config.peer_timeout());
        roles.push(self.role());
        roles.sort();
        roles.dedup();
        roles
    }

    /// Last sighting per role in epoch milliseconds, this process counting as now.
    pub fn last_seen_ms(&self) -> BTreeMap<EventSource, i64> {
        let mut last_seen = self.inner.peers.last_seen_ms();
        last_seen.insert(self.role(), unix_millis_now());
        last_seen
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.cache.snapshot()
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport::collect(
            &self.inner.cache,
            &self.inner.health,
            self.services_connected(),
            LastSeen::from_millis(&self.last_seen_ms()),
        )
        .await
    }
}

impl Drop for CacheBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CacheBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBridge")
            .field("process_id", &self.process_id())
            .field("role", &self.role())
            .field("channel", &self.inner.config.channel)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for [`CacheBridge`].
pub struct CacheBridgeBuilder {
    cache: Arc<TieredCache>,
    config: Option<BridgeConfig>,
    health: Option<HealthConfig>,
    defaults: Option<Arc<dyn DefaultValueProvider>>,
}

impl CacheBridgeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn health_config(mut self, config: HealthConfig) -> Self {
        self.health = Some(config);
        self
    }

    /// Source of warming defaults. Defaults to [`SchemaDefaults`] over the cache's schemas.
    pub fn defaults(mut self, provider: Arc<dyn DefaultValueProvider>) -> Self {
        self.defaults = Some(provider);
        self
    }

    pub fn build(self) -> CacheResult<CacheBridge> {
        let config = self.config.unwrap_or_default();
        if config.channel.trim().is_empty() {
            return Err(CacheError::configuration("bridge channel must not be empty"));
        }
        if config.warm_interval_secs == 0 || config.heartbeat_interval_secs == 0 {
            return Err(CacheError::configuration("bridge intervals must be > 0"));
        }
        let defaults = self
            .defaults
            .unwrap_or_else(|| Arc::new(SchemaDefaults::new(self.cache.schemas().clone())));

        Ok(CacheBridge {
            inner: Arc::new(BridgeInner {
                cache: self.cache,
                config,
                health: self.health.unwrap_or_default(),
                defaults,
                peers: PeerRegistry::new(),
            }),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}
