//! Per-backend circuit breaker.
//!
//! `Closed` lets every call through and counts consecutive failures. After
//! `failure_threshold` of them the breaker opens and rejects calls without
//! touching the network. Once `cooldown` has elapsed the next `allow()` moves
//! it to `HalfOpen` and admits that single call as a trial; everyone else is
//! still rejected until it reports back. One success closes the breaker, one
//! failure re-opens it. A trial call that never reports (its caller was
//! cancelled) is replaced after another `cooldown`. The breaker never
//! retries on its own.

use std::time::{Duration, Instant};

use marketcache_core::Tier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, testing if the backend recovered
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the half-open trial call currently in flight
    trial_started: Option<Instant>,
}

pub struct CircuitBreaker {
    tier: Tier,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(tier: Tier, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            tier,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn from_config(tier: Tier, config: &BreakerConfig) -> Self {
        Self::new(tier, config.failure_threshold, config.cooldown())
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Decide whether a call may be attempted. Checked before every backend call.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let abandoned = inner
                    .trial_started
                    .is_none_or(|started| started.elapsed() >= self.cooldown);
                if abandoned {
                    inner.trial_started = Some(Instant::now());
                }
                abandoned
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    tracing::info!(tier = %self.tier, "circuit half-open, probing backend");
                }
                cooled_down
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_started = None;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            tracing::info!(tier = %self.tier, "circuit closed, backend recovered");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                Self::trip(&mut inner);
                tracing::warn!(tier = %self.tier, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    Self::trip(&mut inner);
                    tracing::warn!(
                        tier = %self.tier,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "circuit opened"
                    );
                }
            }
            // Late failure from a call started before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    fn trip(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_started = None;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("tier", &self.tier)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}
