//! Integration tests against a real Redis.
//!
//! A single container plays both shared tiers (fast on db 1, durable on
//! db 0). Requires a Docker daemon, hence `#[ignore]`:
//! `cargo test -p marketcache --test redis_cache -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use marketcache::config::{BackendConfig, BridgeConfig};
use marketcache::{
    BackendClient, CacheBridge, EventSource, HealthStatus, RedisBackend, Tier, TieredCache,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, u16)> = OnceCell::const_new();

async fn redis_port() -> u16 {
    let (_, port) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, port)
        })
        .await;
    *port
}

async fn backend(tier: Tier) -> Arc<RedisBackend> {
    let config = BackendConfig {
        host: "127.0.0.1".into(),
        port: redis_port().await,
        db: if tier == Tier::Fast { 1 } else { 0 },
        timeout_ms: 1000,
        ..BackendConfig::default()
    };
    Arc::new(RedisBackend::new(tier, &config).expect("redis backend"))
}

async fn process(id: &str) -> Arc<TieredCache> {
    Arc::new(
        TieredCache::builder()
            .fast(backend(Tier::Fast).await, Duration::from_secs(1))
            .durable(backend(Tier::Durable).await, Duration::from_secs(1))
            .process_id(id)
            .build()
            .expect("tiered cache"),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_backend_round_trip() {
    let redis = backend(Tier::Durable).await;
    redis.ping().await.unwrap();

    redis
        .set("test:round_trip", br#"{"a":1}"#, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        redis.get("test:round_trip").await.unwrap().as_deref(),
        Some(br#"{"a":1}"#.as_slice())
    );

    redis.delete("test:round_trip").await.unwrap();
    assert!(redis.get("test:round_trip").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_sub_second_ttl() {
    let redis = backend(Tier::Fast).await;
    redis
        .set("test:short", b"1", Duration::from_millis(100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(redis.get("test:short").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cross_process_visibility_over_redis() {
    let producer = process("redis-producer").await;
    let consumer = process("redis-consumer").await;

    producer
        .set(
            "market:overview",
            br#"{"total_symbols":150,"timestamp":1000}"#.to_vec(),
            Duration::from_secs(300),
        )
        .await
        .unwrap();

    let entry = consumer.get("market:overview").await.unwrap();
    assert_eq!(entry.origin, Tier::Fast);
    assert_eq!(consumer.snapshot().cross_service_hits, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_bridge_events_over_redis_pubsub() {
    let config = BridgeConfig {
        channel: "marketcache:test-events".into(),
        ..BridgeConfig::default()
    };
    let producer = CacheBridge::builder(process("redis-bridge-producer").await)
        .config(BridgeConfig {
            role: EventSource::Producer,
            ..config.clone()
        })
        .build()
        .unwrap();
    let consumer = CacheBridge::builder(process("redis-bridge-consumer").await)
        .config(config)
        .build()
        .unwrap();
    consumer.start().await.unwrap();
    producer.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    producer
        .publish(
            "orderbook:BTCUSDT:snapshot",
            br#"{"symbol":"BTCUSDT","bids":[[100.0,1.0]],"asks":[[101.0,2.0]],"timestamp":1}"#.to_vec(),
            Duration::from_secs(60),
            EventSource::Producer,
        )
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..40 {
        if consumer.cache().local().get("orderbook:BTCUSDT:snapshot").is_some() {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(seen, "update event not delivered");
    assert!(consumer.services_connected().contains(&EventSource::Producer));

    let health = consumer.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    let pool = health.tiers.durable.detail.as_deref().unwrap_or_default();
    assert!(pool.starts_with("pool "), "unexpected detail {pool:?}");

    producer.shutdown().await;
    consumer.shutdown().await;
}
