//! Per-instance circuit breakers
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures. OPEN
//! rejects without calling the instance until `cool_down` has passed, then
//! HALF_OPEN admits exactly one probe: success closes, failure re-opens.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::registry::InstanceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit rejects before allowing a probe
    pub cool_down: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

/// Circuit state of one instance, for the admin surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub instance: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until a probe is allowed, while OPEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

/// Breakers keyed by instance, created lazily
pub struct CircuitBreakers {
    config: CircuitConfig,
    breakers: Arc<DashMap<InstanceKey, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Ask to call an instance. `None` means the circuit rejects the call.
    pub fn acquire(&self, key: &InstanceKey) -> Option<CircuitPermit> {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .entry(key.clone())
            .or_insert_with(Breaker::new);

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let ready = breaker
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.config.cool_down)
                    .unwrap_or(true);
                if !ready {
                    return None;
                }
                info!(instance = %key, "Circuit half-open, admitting probe");
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return None;
                }
                breaker.probe_in_flight = true;
                true
            }
        };

        Some(CircuitPermit {
            breakers: Arc::clone(&self.breakers),
            key: key.clone(),
            threshold: self.config.failure_threshold,
            probe,
            settled: false,
        })
    }

    pub fn state(&self, key: &InstanceKey) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Status of every tracked breaker, sorted by instance
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let now = Instant::now();
        let mut statuses: Vec<CircuitStatus> = self
            .breakers
            .iter()
            .map(|entry| {
                let b = entry.value();
                let retry_in_ms = match (b.state, b.opened_at) {
                    (CircuitState::Open, Some(at)) => Some(
                        self.config
                            .cool_down
                            .saturating_sub(now.duration_since(at))
                            .as_millis() as u64,
                    ),
                    _ => None,
                };
                CircuitStatus {
                    instance: entry.key().to_string(),
                    state: b.state,
                    consecutive_failures: b.consecutive_failures,
                    retry_in_ms,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.instance.cmp(&b.instance));
        statuses
    }
}

/// Admission to call one instance. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping an
/// unsettled probe frees the half-open slot for the next caller.
pub struct CircuitPermit {
    breakers: Arc<DashMap<InstanceKey, Breaker>>,
    key: InstanceKey,
    threshold: u32,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        if let Some(mut breaker) = self.breakers.get_mut(&self.key) {
            if breaker.state != CircuitState::Closed {
                info!(instance = %self.key, "Circuit closed");
            }
            breaker.state = CircuitState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
            breaker.probe_in_flight = false;
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        let now = Instant::now();
        if let Some(mut breaker) = self.breakers.get_mut(&self.key) {
            breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
            match breaker.state {
                CircuitState::HalfOpen => {
                    warn!(instance = %self.key, "Probe failed, circuit re-opened");
                    breaker.open(now);
                }
                CircuitState::Closed if breaker.consecutive_failures >= self.threshold => {
                    warn!(
                        instance = %self.key,
                        failures = breaker.consecutive_failures,
                        "Circuit opened"
                    );
                    breaker.open(now);
                }
                _ => {}
            }
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }
        if let Some(mut breaker) = self.breakers.get_mut(&self.key) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probe_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitConfig {
            failure_threshold: 3,
            cool_down: Duration::from_secs(30),
        })
    }

    fn key() -> InstanceKey {
        InstanceKey::new("accounts", "A1")
    }

    fn fail_n(cb: &CircuitBreakers, n: u32) {
        for _ in 0..n {
            cb.acquire(&key()).unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breakers();
        fail_n(&cb, 2);
        assert_eq!(cb.state(&key()), CircuitState::Closed);
        fail_n(&cb, 1);
        assert_eq!(cb.state(&key()), CircuitState::Open);
        assert!(cb.acquire(&key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let cb = breakers();
        fail_n(&cb, 2);
        cb.acquire(&key()).unwrap().success();
        fail_n(&cb, 2);
        assert_eq!(cb.state(&key()), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_during_cool_down() {
        let cb = breakers();
        fail_n(&cb, 3);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.acquire(&key()).is_none());
        assert_eq!(cb.statuses()[0].retry_in_ms, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = breakers();
        fail_n(&cb, 3);
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = cb.acquire(&key()).unwrap();
        assert!(probe.is_probe());
        assert_eq!(cb.state(&key()), CircuitState::HalfOpen);
        assert!(cb.acquire(&key()).is_none());

        probe.success();
        assert_eq!(cb.state(&key()), CircuitState::Closed);
        assert!(cb.acquire(&key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breakers();
        fail_n(&cb, 3);
        tokio::time::advance(Duration::from_secs(31)).await;

        cb.acquire(&key()).unwrap().failure();
        assert_eq!(cb.state(&key()), CircuitState::Open);
        assert!(cb.acquire(&key()).is_none());

        // Cool-down restarts from the failed probe
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.acquire(&key()).unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = breakers();
        fail_n(&cb, 3);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.acquire(&key()).unwrap());
        assert_eq!(cb.state(&key()), CircuitState::HalfOpen);
        assert!(cb.acquire(&key()).is_some());
    }

    #[tokio::test]
    async fn test_breakers_are_per_instance() {
        let cb = breakers();
        fail_n(&cb, 3);
        let other = InstanceKey::new("accounts", "A2");
        assert!(cb.acquire(&other).is_some());
        assert_eq!(cb.statuses().len(), 2);
    }
}
