//! Heartbeat loop and peer tracking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use marketcache_core::{CacheEvent, EventSource, unix_millis_now};
use tokio_util::sync::CancellationToken;

use super::BridgeInner;

#[derive(Debug, Clone)]
struct Peer {
    role: EventSource,
    seen_at: Instant,
    /// Wall clock of the last heartbeat, for reporting
    seen_at_ms: i64,
}

/// Last heartbeat seen from every other process on the channel.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat (or any event) from `process_id`.
    pub fn observe(&self, process_id: &str, role: EventSource) {
        self.peers.insert(
            process_id.to_string(),
            Peer {
                role,
                seen_at: Instant::now(),
                seen_at_ms: unix_millis_now(),
            },
        );
    }

    /// Number of tracked processes, stale ones included until pruned.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Roles with at least one process seen within `timeout`.
    pub fn connected_roles(&self, timeout: Duration) -> Vec<EventSource> {
        let mut roles: Vec<EventSource> = self
            .peers
            .iter()
            .filter(|peer| peer.seen_at.elapsed() <= timeout)
            .map(|peer| peer.role)
            .collect();
        roles.sort();
        roles.dedup();
        roles
    }

    /// Most recent sighting per role, in epoch milliseconds.
    pub fn last_seen_ms(&self) -> BTreeMap<EventSource, i64> {
        let mut last_seen = BTreeMap::new();
        for peer in self.peers.iter() {
            last_seen
                .entry(peer.role)
                .and_modify(|ms: &mut i64| *ms = (*ms).max(peer.seen_at_ms))
                .or_insert(peer.seen_at_ms);
        }
        last_seen
    }

    /// Forget processes silent for longer than `timeout`. Returns how many were dropped.
    pub fn prune(&self, timeout: Duration) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, peer| peer.seen_at.elapsed() <= timeout);
        before - self.peers.len()
    }
}

/// Publish a heartbeat every interval until cancelled.
pub(super) async fn run(inner: Arc<BridgeInner>, cancel: CancellationToken) {
    let interval = inner.config.heartbeat_interval();
    tracing::info!(interval_secs = interval.as_secs(), "heartbeat loop started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let event = CacheEvent::heartbeat(inner.config.role, inner.cache.process_id());
                inner.publish_event(&event).await;

                // Keep the registry bounded; twice the timeout leaves room for reporting.
                let dropped = inner.peers.prune(inner.config.peer_timeout() * 2);
                if dropped > 0 {
                    tracing::info!(dropped, "forgot silent peers");
                }
            }
        }
    }
    tracing::info!("heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_roles_respect_timeout() {
        let peers = PeerRegistry::new();
        peers.observe("p-1", EventSource::Producer);
        peers.observe("w-1", EventSource::Warmer);
        peers.observe("w-2", EventSource::Warmer);

        assert_eq!(
            peers.connected_roles(Duration::from_secs(60)),
            vec![EventSource::Producer, EventSource::Warmer]
        );
        std::thread::sleep(Duration::from_millis(20));
        assert!(peers.connected_roles(Duration::from_millis(5)).is_empty());
    }

    #[test]
    fn test_prune_and_last_seen() {
        let peers = PeerRegistry::new();
        peers.observe("p-1", EventSource::Producer);
        assert!(peers.last_seen_ms().contains_key(&EventSource::Producer));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(peers.prune(Duration::from_millis(5)), 1);
        assert!(peers.is_empty());
    }
}
