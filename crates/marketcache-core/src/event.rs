//! Events broadcast on the shared pub/sub channel.
//!
//! Delivery is best-effort and at-most-once. A lost event only delays
//! convergence: readers always fall back to the shared tiers, and the
//! durable tier stays authoritative. Consumers must not build stronger
//! guarantees on top of this channel.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{CacheError, CacheResult};
use crate::tier::unix_millis_now;

/// Kind of cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    DataUpdate,
    CacheWarm,
    CacheInvalidate,
    ServiceHeartbeat,
}

/// Logical role of the process that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Producer,
    Consumer,
    Warmer,
}

impl EventSource {
    pub const ALL: [EventSource; 3] = [EventSource::Producer, EventSource::Consumer, EventSource::Warmer];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Producer => "producer",
            EventSource::Consumer => "consumer",
            EventSource::Warmer => "warmer",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventSource {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "producer" => Ok(Self::Producer),
            "consumer" => Ok(Self::Consumer),
            "warmer" => Ok(Self::Warmer),
            other => Err(CacheError::configuration(format!("unknown role {other:?}"))),
        }
    }
}

/// Message carried on the shared channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    pub source: EventSource,
    /// Process that emitted the event
    pub process_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Producer TTL rounded up to whole seconds
    #[serde(default)]
    pub ttl_secs: u64,
    /// Producer TTL in milliseconds; takes precedence over `ttl_secs`
    #[serde(default)]
    pub ttl_ms: u64,
}

impl CacheEvent {
    fn with_payload(
        event_type: EventType,
        key: &str,
        payload: &[u8],
        ttl: Duration,
        source: EventSource,
        process_id: &str,
    ) -> CacheResult<Self> {
        let payload: Box<RawValue> = serde_json::from_slice(payload)?;
        Ok(Self {
            event_type,
            key: key.to_string(),
            payload: Some(payload),
            source,
            process_id: process_id.to_string(),
            timestamp: unix_millis_now(),
            ttl_secs: ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// A fresh value was written by `source`.
    pub fn data_update(
        key: &str,
        payload: &[u8],
        ttl: Duration,
        source: EventSource,
        process_id: &str,
    ) -> CacheResult<Self> {
        Self::with_payload(EventType::DataUpdate, key, payload, ttl, source, process_id)
    }

    /// A safe default was published by the warming loop.
    pub fn cache_warm(key: &str, payload: &[u8], ttl: Duration, process_id: &str) -> CacheResult<Self> {
        Self::with_payload(
            EventType::CacheWarm,
            key,
            payload,
            ttl,
            EventSource::Warmer,
            process_id,
        )
    }

    pub fn invalidate(key: &str, source: EventSource, process_id: &str) -> Self {
        Self {
            event_type: EventType::CacheInvalidate,
            key: key.to_string(),
            payload: None,
            source,
            process_id: process_id.to_string(),
            timestamp: unix_millis_now(),
            ttl_secs: 0,
            ttl_ms: 0,
        }
    }

    pub fn heartbeat(source: EventSource, process_id: &str) -> Self {
        Self {
            event_type: EventType::ServiceHeartbeat,
            key: format!("system:heartbeat:{}", source.as_str()),
            payload: None,
            source,
            process_id: process_id.to_string(),
            timestamp: unix_millis_now(),
            ttl_secs: 0,
            ttl_ms: 0,
        }
    }

    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref().map(|raw| raw.get().as_bytes())
    }

    /// Producer TTL. Zero when the event carries none.
    pub fn ttl(&self) -> Duration {
        if self.ttl_ms > 0 {
            Duration::from_millis(self.ttl_ms)
        } else {
            Duration::from_secs(self.ttl_secs)
        }
    }

    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
