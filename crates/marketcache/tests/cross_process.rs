//! Multi-process behaviour, emulated with several caches sharing
//! `MemoryBackend` instances (one per shared tier).

use std::sync::Arc;
use std::time::Duration;

use marketcache::bridge::EventOutcome;
use marketcache::config::{BreakerConfig, BridgeConfig, LocalTierConfig};
use marketcache::{
    CacheBridge, CacheEvent, CachePayload, CircuitState, EventSource, HealthStatus, MarketOverview,
    MemoryBackend, SignalList, Tier, TierStatus, TierWrite, TieredCache,
};

const TIMEOUT: Duration = Duration::from_millis(200);

struct Shared {
    fast: MemoryBackend,
    durable: MemoryBackend,
}

impl Shared {
    fn new() -> Self {
        Self {
            fast: MemoryBackend::new(Tier::Fast),
            durable: MemoryBackend::new(Tier::Durable),
        }
    }

    fn process(&self, id: &str) -> Arc<TieredCache> {
        self.process_with(id, LocalTierConfig::default(), BreakerConfig::default())
    }

    fn process_with(&self, id: &str, local: LocalTierConfig, breaker: BreakerConfig) -> Arc<TieredCache> {
        Arc::new(
            TieredCache::builder()
                .fast(Arc::new(self.fast.clone()), TIMEOUT)
                .durable(Arc::new(self.durable.clone()), TIMEOUT)
                .local_config(local)
                .breaker_config(breaker)
                .process_id(id)
                .build()
                .unwrap(),
        )
    }

    fn bridge(&self, id: &str, role: EventSource) -> CacheBridge {
        let config = BridgeConfig {
            role,
            heartbeat_interval_secs: 1,
            ..BridgeConfig::default()
        };
        CacheBridge::builder(self.process(id))
            .config(config)
            .build()
            .unwrap()
    }
}

async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_round_trip_served_locally() {
    let shared = Shared::new();
    let cache = shared.process("a");

    cache
        .set("analysis:signals", br#"{"signals":[],"timestamp":5}"#.to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    let entry = cache.get("analysis:signals").await.unwrap();

    assert_eq!(entry.origin, Tier::Local);
    assert_eq!(entry.as_str(), Some(r#"{"signals":[],"timestamp":5}"#));
}

#[tokio::test]
async fn test_cross_process_visibility() {
    let shared = Shared::new();
    let producer = shared.process("producer-1");
    let consumer = shared.process("consumer-1");

    let value = br#"{"total_symbols": 150, "timestamp": 1000}"#.to_vec();
    producer
        .set("market:overview", value.clone(), Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(consumer.snapshot().cross_service_hits, 0);
    let entry = tokio::time::timeout(Duration::from_millis(100), consumer.get("market:overview"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(entry.origin, Tier::Fast);
    assert_eq!(entry.value.as_slice(), value.as_slice());
    assert_eq!(entry.writer.as_deref(), Some("producer-1"));
    let overview: MarketOverview = entry.decode().unwrap();
    assert_eq!(overview.total_symbols, 150);
    assert_eq!(overview.timestamp, 1000);
    assert_eq!(consumer.snapshot().cross_service_hits, 1);

    // The second read is local and not counted again.
    assert_eq!(consumer.get("market:overview").await.unwrap().origin, Tier::Local);
    assert_eq!(consumer.snapshot().cross_service_hits, 1);
}

#[tokio::test]
async fn test_expiry_at_every_tier() {
    let shared = Shared::new();
    let writer = shared.process("a");
    let reader = shared.process("b");

    writer
        .set("market:ticker:BTC", br#"{"price":1}"#.to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(writer.get("market:ticker:BTC").await.is_none());
    assert!(reader.get("market:ticker:BTC").await.is_none());
    assert!(!shared.fast.contains("market:ticker:BTC"));
    assert!(!shared.durable.contains("market:ticker:BTC"));
}

#[tokio::test]
async fn test_capacity_eviction_falls_back_to_shared_tier() {
    let shared = Shared::new();
    let local = LocalTierConfig {
        max_entries: 3,
        ..LocalTierConfig::default()
    };
    let cache = shared.process_with("a", local, BreakerConfig::default());

    for i in 0..4 {
        cache
            .set(&format!("misc:k{i}"), i.to_string().into_bytes(), Duration::from_secs(60))
            .await
            .unwrap();
    }

    assert_eq!(cache.snapshot().local_evictions, 1);
    assert_eq!(cache.local().len(), 3);
    assert!(cache.local().get("misc:k0").is_none());
    assert!(cache.local().get("misc:k3").is_some());

    let entry = cache.get("misc:k0").await.unwrap();
    assert_eq!(entry.origin, Tier::Fast);
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let shared = Shared::new();
    let breaker = BreakerConfig {
        failure_threshold: 5,
        cooldown_secs: 1,
    };
    let cache = shared.process_with("a", LocalTierConfig::default(), breaker);
    shared.fast.set_available(false);

    for i in 0..5 {
        assert!(cache.get(&format!("market:k{i}")).await.is_none());
    }
    let fast = cache.fast().unwrap();
    assert_eq!(fast.circuit_state(), CircuitState::Open);

    // Open: no network attempt, no timeout wait.
    let calls = shared.fast.call_count();
    let started = std::time::Instant::now();
    assert!(cache.get("market:other").await.is_none());
    assert_eq!(shared.fast.call_count(), calls);
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(cache.snapshot().circuit_breakers.get("fast"), Some(&CircuitState::Open));

    // Writes still reach the durable tier.
    let report = cache
        .set("market:overview", br#"{"total_symbols":1,"timestamp":1}"#.to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(report.fast, TierWrite::Skipped);
    assert_eq!(report.durable, TierWrite::Written);
    assert!(report.accepted());

    shared.fast.set_available(true);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(cache.get("market:after").await.is_none());
    assert_eq!(fast.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_warming_fills_missing_critical_keys() {
    let shared = Shared::new();
    let warmer = shared.bridge("warmer-1", EventSource::Warmer);
    let consumer = shared.process("consumer-1");

    let report = warmer.warm_now().await;
    assert_eq!(report.warmed, vec!["market:overview".to_string(), "analysis:signals".to_string()]);
    assert!(shared.fast.contains("market:overview"));

    let overview: MarketOverview =
        MarketOverview::from_payload("market:overview", &consumer.get("market:overview").await.unwrap().value)
            .unwrap();
    assert_eq!(overview.total_symbols, 0);
    assert!(consumer.get("analysis:signals").await.is_some());

    // Present keys are left alone.
    let report = warmer.warm_now().await;
    assert!(report.warmed.is_empty());
    assert_eq!(report.present.len(), 2);
    assert_eq!(warmer.snapshot().warming.defaults_published, 2);
}

#[tokio::test]
async fn test_warming_restores_fast_tier_from_durable() {
    let shared = Shared::new();
    let bridge = shared.bridge("warmer-1", EventSource::Warmer);
    bridge
        .publish(
            "market:overview",
            br#"{"total_symbols":42,"timestamp":7}"#.to_vec(),
            Duration::from_secs(300),
            EventSource::Producer,
        )
        .await
        .unwrap();
    shared.fast.flush();

    let report = bridge.warm_now().await;
    assert!(report.present.contains(&"market:overview".to_string()));
    assert!(shared.fast.contains("market:overview"));
}

#[tokio::test]
async fn test_events_propagate_between_bridges() {
    let shared = Shared::new();
    let producer = shared.bridge("producer-1", EventSource::Producer);
    let consumer = shared.bridge("consumer-1", EventSource::Consumer);
    consumer.start().await.unwrap();
    producer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let signals = SignalList {
        signals: Vec::new(),
        timestamp: 1_700_000_000,
    };
    producer
        .publish_typed("analysis:signals", &signals, Duration::from_secs(60), EventSource::Producer)
        .await
        .unwrap();

    let local = consumer.cache().local();
    assert!(
        eventually(|| {
            local
                .get("analysis:signals")
                .and_then(|entry| entry.decode::<SignalList>().ok())
                .is_some_and(|list| list.timestamp == 1_700_000_000)
        })
        .await
    );
    assert!(consumer.snapshot().events.received >= 1);

    assert!(eventually(|| consumer.services_connected().contains(&EventSource::Producer)).await);
    let health = consumer.health_check().await;
    assert!(health.last_seen.producer.is_some());
    assert!(health.services_connected.contains(&EventSource::Consumer));

    producer.invalidate("analysis:signals").await.unwrap();
    assert!(eventually(|| local.get("analysis:signals").is_none()).await);
    assert!(consumer.get_typed::<SignalList>("analysis:signals").await.is_none());

    producer.shutdown().await;
    consumer.shutdown().await;
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_sub_second_update_expires_on_consumer() {
    let shared = Shared::new();
    let consumer = shared.bridge("consumer-1", EventSource::Consumer);

    let event = CacheEvent::data_update(
        "market:tick",
        br#"{"price":1}"#,
        Duration::from_millis(300),
        EventSource::Producer,
        "producer-1",
    )
    .unwrap();
    assert_eq!(consumer.handle_event(&event), EventOutcome::Applied);
    assert_eq!(consumer.get("market:tick").await.unwrap().origin, Tier::Local);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(consumer.get("market:tick").await.is_none());
}

#[tokio::test]
async fn test_health_check_does_not_evict_from_full_local_tier() {
    let shared = Shared::new();
    let local = LocalTierConfig {
        max_entries: 2,
        ..LocalTierConfig::default()
    };
    let cache = shared.process_with("a", local, BreakerConfig::default());
    let bridge = CacheBridge::builder(Arc::clone(&cache)).build().unwrap();

    cache.set("misc:a", b"1".to_vec(), Duration::from_secs(60)).await.unwrap();
    cache.set("misc:b", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();

    let health = bridge.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.tiers.local.status, TierStatus::Healthy);
    assert_eq!(cache.local().len(), 2);
    assert!(cache.local().get("misc:a").is_some());
    assert!(cache.local().get("misc:b").is_some());
    assert_eq!(cache.snapshot().local_evictions, 0);
}

#[tokio::test]
async fn test_start_warms_before_returning() {
    let shared = Shared::new();
    let bridge = shared.bridge("consumer-1", EventSource::Consumer);
    bridge.start().await.unwrap();

    assert!(bridge.get_typed::<MarketOverview>("market:overview").await.is_some());
    bridge.shutdown().await;
    assert!(bridge.start().await.is_err());
}

#[tokio::test]
async fn test_degraded_mode_without_shared_tiers() {
    let shared = Shared::new();
    let a = shared.bridge("a", EventSource::Producer);
    let b = shared.process("b");
    shared.fast.set_available(false);
    shared.durable.set_available(false);

    let report = a
        .publish(
            "market:overview",
            br#"{"total_symbols":3,"timestamp":1}"#.to_vec(),
            Duration::from_secs(60),
            EventSource::Producer,
        )
        .await
        .unwrap();
    assert!(report.local_only());
    assert_eq!(a.get("market:overview").await.unwrap().origin, Tier::Local);
    assert!(b.get("market:overview").await.is_none());

    let health = a.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.services_connected, vec![EventSource::Producer]);
    assert!(a.snapshot().events.publish_failures >= 1);
}

#[test]
fn test_local_only_cache_without_runtime_setup() {
    let cache = TieredCache::builder().process_id("solo").build().unwrap();
    let report = tokio_test::block_on(cache.set("misc:k", b"[1,2]".to_vec(), Duration::from_secs(5))).unwrap();
    assert_eq!(report.durable, TierWrite::Disabled);

    let entry = tokio_test::block_on(cache.get("misc:k")).unwrap();
    assert_eq!(entry.value.as_slice(), b"[1,2]");
}
