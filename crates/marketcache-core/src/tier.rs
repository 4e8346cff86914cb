//! Tier identifiers, read results and the envelope stored in shared tiers.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use time::OffsetDateTime;

use crate::error::{CacheError, CacheResult};

/// One of the three storage layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// In-process LRU map, no network cost
    Local,
    /// Shared volatile key/value service (sub-millisecond)
    Fast,
    /// Shared persistent key/value service with pub/sub
    Durable,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Local, Tier::Fast, Tier::Durable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Fast => "fast",
            Tier::Durable => "durable",
        }
    }

    /// Shared tiers are the ones another process can observe.
    pub fn is_shared(&self) -> bool {
        !matches!(self, Tier::Local)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest TTL a write may carry. Longer TTLs are rejected at the write path
/// and clamped everywhere a duration is turned into a deadline.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `ttl` in whole milliseconds, saturating instead of wrapping.
pub fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Monotonic deadline `ttl` after `now`, with `ttl` clamped to [`MAX_TTL`].
pub fn expiry_deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
}

/// Current wall clock as milliseconds since the Unix epoch.
pub fn unix_millis_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Convert epoch milliseconds back to a timestamp, clamping garbage to the epoch.
pub fn from_unix_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// A value returned by a cache lookup.
///
/// The payload is wrapped in `Arc` so hits on the local tier hand out the
/// stored bytes without copying them.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Arc<Vec<u8>>,
    /// Tier that satisfied the lookup
    pub origin: Tier,
    /// Wall-clock time of the write that produced this value
    pub written_at: OffsetDateTime,
    /// Time left before the value expires, as seen at read time
    pub ttl: Duration,
    /// Process id of the writer, when known
    pub writer: Option<String>,
}

impl CacheEntry {
    /// Decode the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> CacheResult<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    /// Payload as UTF-8 text (values are JSON, so this is lossless in practice).
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Age of the value relative to now.
    pub fn age(&self) -> Duration {
        Duration::try_from(OffsetDateTime::now_utc() - self.written_at).unwrap_or_default()
    }
}

/// Value as it is persisted in the fast and durable tiers.
///
/// The caller's payload is carried verbatim as raw JSON; the surrounding
/// fields let a reader bound the promoted TTL by the producer TTL and apply
/// last-write-wins by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub written_at_ms: i64,
    pub expires_at_ms: i64,
    pub writer: String,
    pub payload: Arc<Vec<u8>>,
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    written_at_ms: i64,
    expires_at_ms: i64,
    writer: &'a str,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct EnvelopeIn<'a> {
    written_at_ms: i64,
    expires_at_ms: i64,
    writer: String,
    #[serde(borrow)]
    payload: &'a RawValue,
}

impl StoredValue {
    /// Build an envelope for a write happening now.
    pub fn new(writer: impl Into<String>, payload: Arc<Vec<u8>>, ttl: Duration) -> Self {
        let now = unix_millis_now();
        Self {
            written_at_ms: now,
            expires_at_ms: now.saturating_add(ttl_millis(ttl)),
            writer: writer.into(),
            payload,
        }
    }

    /// Serialize to the JSON envelope. Fails if the payload is not JSON.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let payload: &RawValue = serde_json::from_slice(&self.payload)?;
        let out = EnvelopeOut {
            written_at_ms: self.written_at_ms,
            expires_at_ms: self.expires_at_ms,
            writer: &self.writer,
            payload,
        };
        Ok(serde_json::to_vec(&out)?)
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        let env: EnvelopeIn<'_> = serde_json::from_slice(bytes)?;
        Ok(Self {
            written_at_ms: env.written_at_ms,
            expires_at_ms: env.expires_at_ms,
            writer: env.writer,
            payload: Arc::new(env.payload.get().as_bytes().to_vec()),
        })
    }

    /// Remaining lifetime, or `None` once the producer TTL has elapsed.
    pub fn remaining_ttl(&self, now_ms: i64) -> Option<Duration> {
        let left = self.expires_at_ms - now_ms;
        (left > 0).then(|| Duration::from_millis(left as u64))
    }

    pub fn into_entry(self, key: &str, origin: Tier, ttl: Duration) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value: self.payload,
            origin,
            written_at: from_unix_millis(self.written_at_ms),
            ttl,
            writer: Some(self.writer),
        }
    }
}

/// Reject payloads that are not a single well-formed JSON document.
pub fn ensure_json(key: &str, bytes: &[u8]) -> CacheResult<()> {
    serde_json::from_slice::<&RawValue>(bytes)
        .map(|_| ())
        .map_err(|e| CacheError::invalid_payload(key, e.to_string()))
}
