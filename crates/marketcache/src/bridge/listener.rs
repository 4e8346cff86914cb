//! Subscription to the shared event channel.
//!
//! ```text
//! Process A: bridge.publish("market:overview", ..)
//!   ↓
//! Channel:   DATA_UPDATE { key, payload, ttl }
//!   ↓
//! Process B: listener → local tier (short TTL, last write wins)
//! ```
//!
//! Missing an event is harmless: the next read in process B falls through
//! to the shared tiers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use marketcache_core::{
    CacheError, CacheEvent, CacheKey, CacheResult, EventType, KeyClass, unix_millis_now,
};
use tokio_util::sync::CancellationToken;

use super::BridgeInner;
use crate::backend::BackendClient;
use crate::local::LocalInsert;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What the listener did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Same key already holds a newer value
    Stale,
    Evicted,
    PeerSeen,
    /// Emitted by this process
    Own,
    Rejected(String),
}

/// Consume events until cancelled, reconnecting with exponential backoff.
pub(super) async fn run(
    inner: Arc<BridgeInner>,
    client: Arc<dyn BackendClient>,
    cancel: CancellationToken,
) {
    let channel = inner.config.channel.clone();
    tracing::info!(channel = %channel, tier = %client.tier(), "event listener started");

    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = consume(&inner, client.as_ref(), &channel, &mut backoff) => result,
        };

        if let Err(e) = result {
            tracing::error!(
                error = %e,
                backoff_secs = backoff.as_secs(),
                "event listener error, reconnecting"
            );
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    tracing::info!(channel = %channel, "event listener stopped");
}

/// One subscription session. Only returns on failure.
async fn consume(
    inner: &BridgeInner,
    client: &dyn BackendClient,
    channel: &str,
    backoff: &mut Duration,
) -> CacheResult<()> {
    let mut stream = client.subscribe(channel).await?;
    tracing::info!(channel = %channel, "subscribed to event channel");
    *backoff = INITIAL_BACKOFF;

    while let Some(message) = stream.next().await {
        match CacheEvent::from_bytes(&message) {
            Ok(event) => {
                let outcome = handle_event(inner, &event);
                tracing::debug!(
                    event_type = ?event.event_type,
                    key = %event.key,
                    source = %event.source,
                    ?outcome,
                    "cache event received"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable cache event");
                inner.cache.metrics().record_event_dropped();
            }
        }
    }

    Err(CacheError::unavailable(client.tier(), "pub/sub stream ended"))
}

/// Apply one event to this process's state.
pub(crate) fn handle_event(inner: &BridgeInner, event: &CacheEvent) -> EventOutcome {
    let cache = &inner.cache;
    if event.process_id == cache.process_id() {
        return EventOutcome::Own;
    }
    cache.metrics().record_event_received(event.event_type);
    // Any traffic proves the sender is alive.
    inner.peers.observe(&event.process_id, event.source);

    match event.event_type {
        EventType::ServiceHeartbeat => EventOutcome::PeerSeen,
        EventType::CacheInvalidate => {
            cache.evict_local(&event.key);
            EventOutcome::Evicted
        }
        EventType::DataUpdate | EventType::CacheWarm => {
            let Some(payload) = event.payload_bytes() else {
                cache.metrics().record_event_dropped();
                return EventOutcome::Rejected("event without payload".to_string());
            };

            // Local-affinity keys are not shadowed with remote values; dropping
            // the local copy makes the next read go to the shared tiers.
            let class = CacheKey::parse(&event.key)
                .map(|key| cache.policy().classify(&key));
            if matches!(class, Ok(KeyClass::LocalAffinity)) {
                cache.evict_local(&event.key);
                return EventOutcome::Evicted;
            }

            // Clamp a sender clock running ahead of ours.
            let written_at = event.timestamp.min(unix_millis_now());
            match cache.accept_remote(&event.key, payload, event.ttl(), written_at, &event.process_id) {
                Ok(LocalInsert::Stale) => EventOutcome::Stale,
                Ok(_) => EventOutcome::Applied,
                Err(e) => {
                    tracing::warn!(key = %event.key, error = %e, "rejecting remote cache update");
                    cache.metrics().record_event_dropped();
                    EventOutcome::Rejected(e.to_string())
                }
            }
        }
    }
}
