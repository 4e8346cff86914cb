//! Core types for the marketcache tiered cache.
//!
//! This crate has no I/O. It defines what moves between tiers and processes:
//! tier identifiers and the shared-tier envelope, the key namespace and its
//! classification, pub/sub events, typed payload schemas and the error
//! taxonomy.

pub mod error;
pub mod event;
pub mod key;
pub mod schema;
pub mod tier;

pub use error::{CacheError, CacheResult};
pub use event::{CacheEvent, EventSource, EventType};
pub use key::{CacheKey, KeyClass, KeyPolicy, MAX_KEY_LEN};
pub use schema::{
    CachePayload, MarketOverview, OrderBookSnapshot, SchemaRegistry, Signal, SignalDirection,
    SignalList,
};
pub use tier::{
    CacheEntry, MAX_TTL, StoredValue, Tier, ensure_json, expiry_deadline, from_unix_millis, ttl_millis,
    unix_millis_now,
};
