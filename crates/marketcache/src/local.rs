//! In-process tier: bounded LRU map with per-entry TTL.
//!
//! Capacity eviction wins over TTL eviction: inserting into a full tier
//! always succeeds and drops the least-recently-used entry, expired or not.
//! Expired entries are removed lazily when a lookup touches them.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use marketcache_core::{
    CacheEntry, CacheError, CacheResult, Tier, expiry_deadline, from_unix_millis, unix_millis_now,
};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Arc<Vec<u8>>,
    expires_at: Instant,
    /// Wall-clock write time, used for last-write-wins on pub/sub updates
    written_at_ms: i64,
    writer: Option<String>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of inserting into the local tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInsert {
    Inserted,
    /// A different key was dropped to make room
    Evicted(String),
    /// A newer value was already present
    Stale,
}

pub struct LocalTier {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalTier {
    pub fn new(max_entries: usize) -> CacheResult<Self> {
        let capacity = NonZeroUsize::new(max_entries).ok_or_else(|| {
            CacheError::configuration("local tier max_entries must be > 0")
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                return Some(CacheEntry {
                    key: key.to_string(),
                    value: Arc::clone(&entry.value),
                    origin: Tier::Local,
                    written_at: from_unix_millis(entry.written_at_ms),
                    ttl: entry.expires_at.saturating_duration_since(now),
                    writer: entry.writer.clone(),
                });
            }
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Insert a value written now by this process.
    pub fn set(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration) -> LocalInsert {
        self.insert(key, value, ttl, unix_millis_now(), None, false)
    }

    /// Insert a value written at `written_at_ms` by `writer`, replacing whatever is stored.
    pub fn set_written(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        written_at_ms: i64,
        writer: Option<String>,
    ) -> LocalInsert {
        self.insert(key, value, ttl, written_at_ms, writer, false)
    }

    /// Insert a value written elsewhere at `written_at_ms`, keeping a newer local value.
    pub fn set_if_newer(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        written_at_ms: i64,
        writer: Option<String>,
    ) -> LocalInsert {
        self.insert(key, value, ttl, written_at_ms, writer, true)
    }

    fn insert(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        written_at_ms: i64,
        writer: Option<String>,
        keep_newer: bool,
    ) -> LocalInsert {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if keep_newer {
            if let Some(existing) = entries.peek(key) {
                if !existing.is_expired(now) && existing.written_at_ms > written_at_ms {
                    return LocalInsert::Stale;
                }
            }
        }

        let entry = LocalEntry {
            value,
            expires_at: expiry_deadline(now, ttl),
            written_at_ms,
            writer,
        };
        match entries.push(key.to_string(), entry) {
            Some((evicted, _)) if evicted != key => LocalInsert::Evicted(evicted),
            _ => LocalInsert::Inserted,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Health check that stores nothing: drops expired entries and confirms
    /// the map stays within its capacity. Returns `(len, capacity, purged)`.
    pub fn inspect(&self) -> (usize, usize, usize) {
        let purged = self.purge_expired();
        let entries = self.entries.lock();
        (entries.len(), entries.cap().get(), purged)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for LocalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("LocalTier")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Arc<Vec<u8>> {
        Arc::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(LocalTier::new(0), Err(CacheError::Configuration(_))));
    }

    #[test]
    fn test_get_set() {
        let tier = LocalTier::new(10).unwrap();
        tier.set("market:overview", bytes("1"), Duration::from_secs(30));

        let entry = tier.get("market:overview").unwrap();
        assert_eq!(entry.value.as_slice(), b"1");
        assert_eq!(entry.origin, Tier::Local);
        assert!(entry.ttl <= Duration::from_secs(30));
        assert!(tier.get("market:missing").is_none());
    }

    #[test]
    fn test_expiry_is_lazy() {
        let tier = LocalTier::new(10).unwrap();
        tier.set("k:1", bytes("1"), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(30));

        // Still physically present until touched.
        assert_eq!(tier.len(), 1);
        assert!(tier.get("k:1").is_none());
        assert_eq!(tier.len(), 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let tier = LocalTier::new(3).unwrap();
        tier.set("k:a", bytes("1"), Duration::from_secs(60));
        tier.set("k:b", bytes("2"), Duration::from_secs(60));
        tier.set("k:c", bytes("3"), Duration::from_secs(60));

        // Touch "a" so "b" becomes the LRU entry.
        assert!(tier.get("k:a").is_some());

        let outcome = tier.set("k:d", bytes("4"), Duration::from_secs(60));
        assert_eq!(outcome, LocalInsert::Evicted("k:b".to_string()));
        assert_eq!(tier.len(), 3);
        assert!(tier.get("k:b").is_none());
        assert!(tier.get("k:a").is_some());
        assert!(tier.get("k:d").is_some());
    }

    #[test]
    fn test_full_tier_never_blocks_writes() {
        let tier = LocalTier::new(2).unwrap();
        for i in 0..100 {
            tier.set(&format!("k:{i}"), bytes("x"), Duration::from_secs(60));
        }
        assert_eq!(tier.len(), 2);
        assert!(tier.get("k:99").is_some());
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let tier = LocalTier::new(1).unwrap();
        tier.set("k:a", bytes("1"), Duration::from_secs(60));
        assert_eq!(
            tier.set("k:a", bytes("2"), Duration::from_secs(60)),
            LocalInsert::Inserted
        );
        assert_eq!(tier.get("k:a").unwrap().value.as_slice(), b"2");
    }

    #[test]
    fn test_set_if_newer_keeps_latest_write() {
        let tier = LocalTier::new(10).unwrap();
        tier.set_if_newer("k:a", bytes("new"), Duration::from_secs(60), 2_000, None);

        let outcome = tier.set_if_newer("k:a", bytes("old"), Duration::from_secs(60), 1_000, None);
        assert_eq!(outcome, LocalInsert::Stale);
        assert_eq!(tier.get("k:a").unwrap().value.as_slice(), b"new");

        tier.set_if_newer("k:a", bytes("newer"), Duration::from_secs(60), 3_000, Some("p2".into()));
        let entry = tier.get("k:a").unwrap();
        assert_eq!(entry.value.as_slice(), b"newer");
        assert_eq!(entry.writer.as_deref(), Some("p2"));
    }

    #[test]
    fn test_oversized_ttl_is_clamped() {
        let tier = LocalTier::new(2).unwrap();
        tier.set("k:a", bytes("1"), Duration::MAX);
        let entry = tier.get("k:a").unwrap();
        assert!(entry.ttl <= marketcache_core::MAX_TTL);
    }

    #[test]
    fn test_remove_and_purge() {
        let tier = LocalTier::new(10).unwrap();
        tier.set("k:a", bytes("1"), Duration::from_secs(60));
        tier.set("k:b", bytes("2"), Duration::from_millis(10));
        assert!(tier.remove("k:a"));
        assert!(!tier.remove("k:a"));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_inspect_keeps_live_entries() {
        let tier = LocalTier::new(2).unwrap();
        tier.set("k:a", bytes("1"), Duration::from_secs(60));
        tier.set("k:b", bytes("2"), Duration::from_secs(60));

        assert_eq!(tier.inspect(), (2, 2, 0));
        assert!(tier.get("k:a").is_some());
        assert!(tier.get("k:b").is_some());
    }
}
