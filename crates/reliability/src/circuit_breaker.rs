//! Per-service circuit breakers.
//!
//! ```text
//! Closed ──(failures ≥ threshold)──► Open ──(cooldown elapsed)──► HalfOpen
//!    ▲                                 ▲                              │
//!    └──────────(trial succeeds)───────┼──────────────────────────────┤
//!                                      └───────(trial fails)──────────┘
//! ```
//!
//! Breakers perform no I/O. Time comes from an injected [`Clock`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use common::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use store::KeyValueStore;

const SNAPSHOT_KEY: &str = "circuit_breakers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a trial.
    pub cooldown: chrono::Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: chrono::Duration::seconds(60),
        }
    }
}

/// Serializable view of a breaker, used for admin inspection and restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub cooldown_seconds: i64,
    pub last_failure_reason: Option<String>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_failure_reason: Option<String>,
    trial_in_flight: bool,
}

/// A circuit breaker guarding one downstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service_id: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(service_id, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        service_id: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_reason: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Poisoned state is still plain counters.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if a call may proceed.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits exactly one trial; later callers are rejected until
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) resolves it.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = s
                    .opened_at
                    .is_none_or(|opened| now - opened >= self.config.cooldown);
                if cooled {
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    tracing::info!(service = %self.service_id, "circuit half-open, admitting trial");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    false
                } else {
                    s.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a failed call. Returns true if this failure opened the circuit.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        let now = self.clock.now();
        let reason = reason.into();
        let mut s = self.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure_reason = Some(reason.clone());

        let should_open = match s.state {
            CircuitState::Closed => s.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            // Already open: keep the original cooldown start.
            CircuitState::Open => false,
        };

        if should_open {
            s.state = CircuitState::Open;
            s.opened_at = Some(now);
            s.trial_in_flight = false;
            metrics::counter!("circuit_opened_total", "service" => self.service_id.clone())
                .increment(1);
            tracing::warn!(
                service = %self.service_id,
                failures = s.consecutive_failures,
                reason = %reason,
                "circuit opened"
            );
        }
        should_open
    }

    /// Records a successful call, closing the circuit.
    pub fn record_success(&self) {
        let mut s = self.lock();
        if s.state != CircuitState::Closed {
            tracing::info!(service = %self.service_id, "circuit closed");
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
        s.trial_in_flight = false;
    }

    /// Gives back an admitted half-open trial whose call ended without
    /// telling anything about the service's health.
    pub fn abandon_trial(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// When an open breaker will next admit a trial. `None` unless open.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        let s = self.lock();
        match s.state {
            CircuitState::Open => s.opened_at.map(|opened| opened + self.config.cooldown),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let s = self.lock();
        CircuitBreakerSnapshot {
            service_id: self.service_id.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            opened_at: s.opened_at,
            failure_threshold: self.config.failure_threshold,
            cooldown_seconds: self.config.cooldown.num_seconds(),
            last_failure_reason: s.last_failure_reason.clone(),
        }
    }

    /// Seeds the breaker from a snapshot. A restored half-open breaker has
    /// no trial in flight.
    pub fn restore(&self, snapshot: &CircuitBreakerSnapshot) {
        let mut s = self.lock();
        s.state = snapshot.state;
        s.consecutive_failures = snapshot.consecutive_failures;
        s.opened_at = snapshot.opened_at;
        s.last_failure_reason = snapshot.last_failure_reason.clone();
        s.trial_in_flight = false;
    }
}

/// Hands out one shared breaker per service ID.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `service_id`, creating it on first use.
    pub fn get(&self, service_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    service_id,
                    self.config,
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Snapshots of every known breaker, sorted by service ID.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        snapshots
    }

    pub fn restore(&self, snapshot: &CircuitBreakerSnapshot) {
        self.get(&snapshot.service_id).restore(snapshot);
    }

    /// Writes all snapshots to the key-value store.
    pub async fn save_to(&self, kv: &dyn KeyValueStore) -> store::Result<()> {
        let value = serde_json::to_value(self.snapshots())?;
        kv.set(SNAPSHOT_KEY, value, None).await
    }

    /// Restores breakers saved by [`save_to`](Self::save_to). Returns the
    /// number restored.
    pub async fn load_from(&self, kv: &dyn KeyValueStore) -> store::Result<usize> {
        let Some(value) = kv.get(SNAPSHOT_KEY).await? else {
            return Ok(0);
        };
        let snapshots: Vec<CircuitBreakerSnapshot> = serde_json::from_value(value)?;
        for snapshot in &snapshots {
            self.restore(snapshot);
        }
        Ok(snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;
    use store::InMemoryKeyValueStore;

    fn breaker(threshold: u32, cooldown_secs: i64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::default();
        let breaker = CircuitBreaker::with_clock(
            "payment_gateway",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: chrono::Duration::seconds(cooldown_secs),
            },
            Arc::new(clock.clone()),
        );
        (breaker, clock)
    }

    #[test]
    fn opens_at_threshold() {
        let (breaker, _) = breaker(3, 60);
        assert!(!breaker.record_failure("timeout"));
        assert!(!breaker.record_failure("timeout"));
        assert!(breaker.is_available());
        assert!(breaker.record_failure("timeout"));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());
    }

    #[test]
    fn success_resets_failure_count() {
        let (breaker, _) = breaker(3, 60);
        breaker.record_failure("a");
        breaker.record_failure("b");
        breaker.record_success();
        breaker.record_failure("c");
        breaker.record_failure("d");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn cooldown_admits_a_single_trial() {
        let (breaker, clock) = breaker(1, 30);
        breaker.record_failure("down");
        clock.advance(chrono::Duration::seconds(29));
        assert!(!breaker.is_available());

        clock.advance(chrono::Duration::seconds(1));
        assert!(breaker.is_available());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.is_available());
        assert!(!breaker.is_available());
    }

    #[test]
    fn successful_trial_closes() {
        let (breaker, clock) = breaker(1, 30);
        breaker.record_failure("down");
        clock.advance(chrono::Duration::seconds(30));
        assert!(breaker.is_available());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.is_available());
        assert!(breaker.is_available());
    }

    #[test]
    fn failed_trial_reopens_with_fresh_cooldown() {
        let (breaker, clock) = breaker(3, 30);
        for _ in 0..3 {
            breaker.record_failure("down");
        }
        clock.advance(chrono::Duration::seconds(30));
        assert!(breaker.is_available());

        assert!(breaker.record_failure("still down"));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.retry_after(), Some(clock.now() + chrono::Duration::seconds(30)));
        assert!(!breaker.is_available());
    }

    #[test]
    fn abandoned_trial_admits_another() {
        let (breaker, clock) = breaker(1, 30);
        breaker.record_failure("down");
        clock.advance(chrono::Duration::seconds(30));
        assert!(breaker.is_available());
        assert!(!breaker.is_available());
        breaker.abandon_trial();
        assert!(breaker.is_available());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn failures_while_open_keep_cooldown_start() {
        let (breaker, clock) = breaker(1, 30);
        breaker.record_failure("down");
        let retry_after = breaker.retry_after();
        clock.advance(chrono::Duration::seconds(10));
        assert!(!breaker.record_failure("late report"));
        assert_eq!(breaker.retry_after(), retry_after);
    }

    #[test]
    fn retry_after_is_none_when_closed() {
        let (breaker, _) = breaker(2, 30);
        assert!(breaker.retry_after().is_none());
    }

    #[test]
    fn registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("messaging").record_failure("auth");
        assert_eq!(registry.get("messaging").state(), CircuitState::Open);
        assert_eq!(registry.get("payment_gateway").state(), CircuitState::Closed);

        let ids: Vec<_> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.service_id)
            .collect();
        assert_eq!(ids, vec!["messaging", "payment_gateway"]);
    }

    #[test]
    fn restore_seeds_state() {
        let registry = CircuitBreakerRegistry::default();
        let opened_at = Utc::now();
        registry.restore(&CircuitBreakerSnapshot {
            service_id: "messaging".to_string(),
            state: CircuitState::Open,
            consecutive_failures: 7,
            opened_at: Some(opened_at),
            failure_threshold: 5,
            cooldown_seconds: 60,
            last_failure_reason: Some("rate limited".to_string()),
        });
        let snapshot = registry.get("messaging").snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 7);
        assert_eq!(snapshot.opened_at, Some(opened_at));
    }

    #[tokio::test]
    async fn snapshots_survive_a_key_value_round_trip() {
        let kv = InMemoryKeyValueStore::new();
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("messaging").record_failure("auth");
        registry.save_to(&kv).await.unwrap();

        let restored = CircuitBreakerRegistry::default();
        assert_eq!(restored.load_from(&kv).await.unwrap(), 1);
        assert_eq!(restored.get("messaging").state(), CircuitState::Open);
    }
}
