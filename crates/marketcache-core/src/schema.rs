//! Typed payload schemas and the registry that enforces them at the tier boundary.
//!
//! The cache itself stores opaque JSON bytes. Keys with a registered schema
//! get their payload checked on write (malformed values are rejected) and on
//! read from a shared tier (malformed values read as a miss). Keys without a
//! schema only need to be well-formed JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::tier::ensure_json;

/// A payload type with explicit validation and a safe default.
pub trait CachePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key category the payload belongs to.
    const CATEGORY: &'static str;

    /// Exact key when the payload is a singleton (e.g. `market:overview`).
    const KEY: Option<&'static str> = None;

    fn validate(&self) -> Result<(), String>;

    /// Empty but valid value used when a critical key has to be warmed
    /// before any producer wrote it.
    fn safe_default(key: &CacheKey) -> Self;

    /// Validate and serialize.
    fn to_payload(&self, key: &str) -> CacheResult<Vec<u8>> {
        self.validate()
            .map_err(|reason| CacheError::invalid_payload(key, reason))?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize and validate.
    fn from_payload(key: &str, bytes: &[u8]) -> CacheResult<Self> {
        let value: Self = serde_json::from_slice(bytes)
            .map_err(|e| CacheError::invalid_payload(key, e.to_string()))?;
        value
            .validate()
            .map_err(|reason| CacheError::invalid_payload(key, reason))?;
        Ok(value)
    }
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn finite(name: &str, v: f64) -> Result<(), String> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(format!("{name} must be finite"))
    }
}

/// Aggregate market statistics, published under `market:overview`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOverview {
    pub total_symbols: u32,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub gainers: u32,
    #[serde(default)]
    pub losers: u32,
    #[serde(default)]
    pub avg_change_pct: f64,
    #[serde(default)]
    pub total_volume: f64,
}

impl CachePayload for MarketOverview {
    const CATEGORY: &'static str = "market";
    const KEY: Option<&'static str> = Some("market:overview");

    fn validate(&self) -> Result<(), String> {
        if self.timestamp < 0 {
            return Err("timestamp must not be negative".into());
        }
        if u64::from(self.gainers) + u64::from(self.losers) > u64::from(self.total_symbols) {
            return Err("gainers + losers exceeds total_symbols".into());
        }
        finite("avg_change_pct", self.avg_change_pct)?;
        finite("total_volume", self.total_volume)?;
        if self.total_volume < 0.0 {
            return Err("total_volume must not be negative".into());
        }
        Ok(())
    }

    fn safe_default(_key: &CacheKey) -> Self {
        Self {
            total_symbols: 0,
            timestamp: now_secs(),
            gainers: 0,
            losers: 0,
            avg_change_pct: 0.0,
            total_volume: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Buy,
    Sell,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: SignalDirection,
    /// Confidence in `0.0..=1.0`
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub timestamp: i64,
}

/// Current signal list, published under `analysis:signals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalList {
    pub signals: Vec<Signal>,
    pub timestamp: i64,
}

impl CachePayload for SignalList {
    const CATEGORY: &'static str = "analysis";
    const KEY: Option<&'static str> = Some("analysis:signals");

    fn validate(&self) -> Result<(), String> {
        if self.timestamp < 0 {
            return Err("timestamp must not be negative".into());
        }
        for signal in &self.signals {
            if signal.symbol.trim().is_empty() {
                return Err("signal symbol must not be empty".into());
            }
            if !(0.0..=1.0).contains(&signal.strength) {
                return Err(format!(
                    "signal strength for {} must be within 0..=1",
                    signal.symbol
                ));
            }
            if let Some(price) = signal.price {
                if !price.is_finite() || price <= 0.0 {
                    return Err(format!("signal price for {} must be positive", signal.symbol));
                }
            }
        }
        Ok(())
    }

    fn safe_default(_key: &CacheKey) -> Self {
        Self {
            signals: Vec::new(),
            timestamp: now_secs(),
        }
    }
}

/// Order book top levels, published under `orderbook:<symbol>:snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// `[price, quantity]`, best first
    pub bids: Vec<[f64; 2]>,
    pub asks: Vec<[f64; 2]>,
    pub timestamp: i64,
}

impl CachePayload for OrderBookSnapshot {
    const CATEGORY: &'static str = "orderbook";

    fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".into());
        }
        for [price, qty] in self.bids.iter().chain(self.asks.iter()) {
            if !price.is_finite() || *price <= 0.0 || !qty.is_finite() || *qty < 0.0 {
                return Err("order book levels must have positive price and non-negative quantity".into());
            }
        }
        if let (Some(bid), Some(ask)) = (self.bids.first(), self.asks.first()) {
            if bid[0] >= ask[0] {
                return Err("best bid must be below best ask".into());
            }
        }
        Ok(())
    }

    fn safe_default(key: &CacheKey) -> Self {
        let symbol = key
            .identifier()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            symbol,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: now_secs(),
        }
    }
}

#[derive(Clone, Copy)]
struct SchemaEntry {
    name: &'static str,
    validate: fn(&str, &[u8]) -> CacheResult<()>,
    default: fn(&CacheKey) -> CacheResult<Vec<u8>>,
}

fn validate_as<T: CachePayload>(key: &str, bytes: &[u8]) -> CacheResult<()> {
    T::from_payload(key, bytes).map(|_| ())
}

fn default_as<T: CachePayload>(key: &CacheKey) -> CacheResult<Vec<u8>> {
    T::safe_default(key).to_payload(key.as_str())
}

/// Maps keys (exact or by category) to payload schemas.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    exact: HashMap<String, SchemaEntry>,
    by_category: HashMap<String, SchemaEntry>,
}

impl SchemaRegistry {
    /// Empty registry: every key only needs to be valid JSON.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in market data schemas.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<MarketOverview>();
        registry.register::<SignalList>();
        registry.register::<OrderBookSnapshot>();
        registry
    }

    pub fn register<T: CachePayload>(&mut self) -> &mut Self {
        let entry = SchemaEntry {
            name: std::any::type_name::<T>(),
            validate: validate_as::<T>,
            default: default_as::<T>,
        };
        match T::KEY {
            Some(key) => self.exact.insert(key.to_string(), entry),
            None => self.by_category.insert(T::CATEGORY.to_string(), entry),
        };
        self
    }

    fn lookup(&self, key: &CacheKey) -> Option<&SchemaEntry> {
        self.exact
            .get(key.as_str())
            .or_else(|| self.by_category.get(key.category()))
    }

    /// Name of the schema governing `key`, if any.
    pub fn schema_name(&self, key: &CacheKey) -> Option<&'static str> {
        self.lookup(key).map(|entry| entry.name)
    }

    /// Check a payload against the schema for `key`.
    pub fn validate(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        match self.lookup(key) {
            Some(entry) => (entry.validate)(key.as_str(), bytes),
            None => ensure_json(key.as_str(), bytes),
        }
    }

    /// Safe default for `key`, or `None` when no schema is registered.
    pub fn safe_default(&self, key: &CacheKey) -> Option<CacheResult<Vec<u8>>> {
        self.lookup(key).map(|entry| (entry.default)(key))
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("by_category", &self.by_category.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> CacheKey {
        CacheKey::parse(raw).unwrap()
    }

    #[test]
    fn test_market_overview_minimal_payload() {
        let bytes = serde_json::to_vec(&json!({"total_symbols": 150, "timestamp": 1000})).unwrap();
        let overview = MarketOverview::from_payload("market:overview", &bytes).unwrap();
        assert_eq!(overview.total_symbols, 150);
        assert_eq!(overview.gainers, 0);
    }

    #[test]
    fn test_market_overview_rejects_inconsistent_counts() {
        let bytes = serde_json::to_vec(&json!({
            "total_symbols": 10, "timestamp": 1, "gainers": 8, "losers": 5
        }))
        .unwrap();
        let err = MarketOverview::from_payload("market:overview", &bytes).unwrap_err();
        assert!(matches!(err, CacheError::InvalidPayload { .. }));
    }

    #[test]
    fn test_signal_strength_range() {
        let list = SignalList {
            signals: vec![Signal {
                symbol: "ETHUSDT".into(),
                direction: SignalDirection::Buy,
                strength: 1.5,
                price: None,
                timestamp: 1,
            }],
            timestamp: 1,
        };
        assert!(list.validate().is_err());
        assert!(list.to_payload("analysis:signals").is_err());
    }

    #[test]
    fn test_orderbook_crossed_book_rejected() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".into(),
            bids: vec![[101.0, 1.0]],
            asks: vec![[100.0, 1.0]],
            timestamp: 1,
        };
        assert!(book.validate().is_err());
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = SchemaRegistry::with_defaults();

        assert!(registry.schema_name(&key("market:overview")).is_some());
        assert!(registry.schema_name(&key("orderbook:BTCUSDT:snapshot")).is_some());
        assert!(registry.schema_name(&key("market:heatmap")).is_none());

        // Unregistered keys only need valid JSON.
        assert!(registry.validate(&key("market:heatmap"), b"[1,2]").is_ok());
        assert!(registry.validate(&key("market:heatmap"), b"nope").is_err());

        // Registered keys must match their schema.
        assert!(registry.validate(&key("market:overview"), b"{}").is_err());
    }

    #[test]
    fn test_registry_defaults_are_valid() {
        let registry = SchemaRegistry::with_defaults();
        for raw in ["market:overview", "analysis:signals", "orderbook:SOLUSDT:snapshot"] {
            let k = key(raw);
            let bytes = registry.safe_default(&k).unwrap().unwrap();
            registry.validate(&k, &bytes).unwrap();
        }

        let book: OrderBookSnapshot = serde_json::from_slice(
            &registry
                .safe_default(&key("orderbook:SOLUSDT:snapshot"))
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(book.symbol, "SOLUSDT");
        assert!(registry.safe_default(&key("system:misc")).is_none());
    }
}
