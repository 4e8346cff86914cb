//! In-process backend for single-node development and tests.
//!
//! Clones share the same storage and channels, so handing clones of one
//! `MemoryBackend` to several `TieredCache` instances emulates several
//! processes talking to one shared service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use marketcache_core::{CacheError, CacheResult, Tier, expiry_deadline};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{BackendClient, EventStream};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

struct StoredBytes {
    data: Vec<u8>,
    expires_at: Instant,
}

struct MemoryInner {
    entries: DashMap<String, StoredBytes>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryBackend {
    tier: Tier,
    inner: Arc<MemoryInner>,
}

impl MemoryBackend {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            inner: Arc::new(MemoryInner {
                entries: DashMap::new(),
                channels: DashMap::new(),
                available: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                calls: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate an outage (`false`) or a recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Add artificial latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Number of calls that reached the backend, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Whether a live value is stored, without counting a call.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop everything, as a restart of a volatile service would.
    pub fn flush(&self) {
        self.inner.entries.clear();
    }

    async fn enter(&self) -> CacheResult<()> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::unavailable(self.tier, "memory backend marked unavailable"))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.tier)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.enter().await?;
        let now = Instant::now();
        let expired = match self.inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.enter().await?;
        self.inner.entries.insert(
            key.to_string(),
            StoredBytes {
                data: value.to_vec(),
                expires_at: expiry_deadline(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.enter().await?;
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> CacheResult<()> {
        self.enter().await?;
        // No subscribers is not an error, matching PUBLISH semantics.
        let _ = self.sender(channel).send(message.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<EventStream> {
        self.enter().await?;
        let rx = self.sender(channel).subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> CacheResult<()> {
        self.enter().await
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tier", &self.tier)
            .field("entries", &self.inner.entries.len())
            .field("available", &self.inner.available.load(Ordering::Relaxed))
            .finish()
    }
}
