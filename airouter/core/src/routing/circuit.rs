//! Circuit Breaker Registry
//!
//! One circuit breaker per `(provider, path)`. The registry is the only
//! writer of circuit state; request flows, the health monitor and operators
//! all go through it.
//!
//! ```text
//! +--------+   F consecutive failures   +------+    cooldown elapsed,    +-----------+
//! | Closed | -------------------------> | Open | ----------------------> | Half-Open |
//! +--------+                            +------+   next check = 1 trial  +-----------+
//!     ^                                     ^                                  |
//!     |            trial succeeds           |        trial fails               |
//!     +-------------------------------------+----------------------------------+
//! ```
//!
//! # Thread Safety
//!
//! Each key's state is one `parking_lot::Mutex`-guarded unit, so a reader
//! never observes a half-applied transition. Keys for different providers
//! live in separate `DashMap` entries and never contend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::request::RoutePath;
use crate::sinks::{AuditEvent, AuditEventType, AuditSink};

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Tripped, traffic rejected
    Open,
    /// Cooldown elapsed, one trial admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Breaker thresholds (operator-mutable at runtime)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a trial
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Per-key State
// ============================================================================

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    /// 0 = never
    last_failure_at: u64,
    /// 0 = never
    last_probe_at: u64,
    /// Start of the current cooldown
    opened_at: u64,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejections: u64,
}

/// Both breakers of one provider
#[derive(Debug, Default)]
struct ProviderCircuits {
    direct: Mutex<BreakerState>,
    brokered: Mutex<BreakerState>,
}

impl ProviderCircuits {
    fn path(&self, path: RoutePath) -> &Mutex<BreakerState> {
        match path {
            RoutePath::Direct => &self.direct,
            RoutePath::Brokered => &self.brokered,
        }
    }
}

/// A state change, announced after the key's lock is released
#[derive(Debug)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    consecutive_failures: u32,
    cause: &'static str,
}

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Provider ID
    pub provider: String,
    /// Path
    pub path: RoutePath,
    /// State
    pub state: CircuitState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Last failure (clock ms)
    pub last_failure_at_ms: Option<u64>,
    /// Last health probe (clock ms)
    pub last_probe_at_ms: Option<u64>,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Checks rejected while open
    pub rejections: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Circuit breakers for every `(provider, path)`
pub struct CircuitBreakerRegistry {
    providers: DashMap<String, Arc<ProviderCircuits>>,
    config: RwLock<BreakerConfig>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreakerRegistry {
    /// Create a registry
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            providers: DashMap::new(),
            config: RwLock::new(config),
            clock,
            audit,
        }
    }

    /// Current thresholds
    pub fn config(&self) -> BreakerConfig {
        *self.config.read()
    }

    /// Replace thresholds; applies to the next check or record
    pub fn set_config(&self, config: BreakerConfig) {
        *self.config.write() = config;
        tracing::info!(
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker configuration updated"
        );
    }

    /// Make sure both breakers of a provider exist
    pub fn register(&self, provider: &str) {
        self.circuits(provider);
    }

    /// Check whether a request may use `(provider, path)`
    ///
    /// Consuming: when an open circuit has cooled down, this call moves it
    /// to half-open and hands the single trial to the caller. Every other
    /// caller is rejected until that trial is recorded or released.
    pub fn is_available(&self, provider: &str, path: RoutePath) -> bool {
        let now = self.clock.now_ms();
        let cooldown_ms = self.cooldown_ms();
        let circuits = self.circuits(provider);

        let (admitted, transition) = {
            let mut st = circuits.path(path).lock();
            match st.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    if now.saturating_sub(st.opened_at) >= cooldown_ms {
                        st.state = CircuitState::HalfOpen;
                        st.trial_in_flight = true;
                        let t = Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            consecutive_failures: st.consecutive_failures,
                            cause: "cooldown_elapsed",
                        };
                        (true, Some(t))
                    } else {
                        st.rejections += 1;
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if st.trial_in_flight {
                        st.rejections += 1;
                        (false, None)
                    } else {
                        st.trial_in_flight = true;
                        (true, None)
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.announce(provider, path, &t);
        }
        admitted
    }

    /// Non-consuming variant of [`is_available`](Self::is_available)
    ///
    /// Answers "would a check right now admit a request" without taking
    /// the half-open trial.
    pub fn admits(&self, provider: &str, path: RoutePath) -> bool {
        let Some(circuits) = self.existing(provider) else {
            return true;
        };
        let now = self.clock.now_ms();
        let cooldown_ms = self.cooldown_ms();
        let st = circuits.path(path).lock();

        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => now.saturating_sub(st.opened_at) >= cooldown_ms,
            CircuitState::HalfOpen => !st.trial_in_flight,
        }
    }

    /// Record a successful call
    ///
    /// A success on an open circuit (a late reply from before it tripped)
    /// is counted but does not change state.
    pub fn record_success(&self, provider: &str, path: RoutePath) {
        let circuits = self.circuits(provider);

        let transition = {
            let mut st = circuits.path(path).lock();
            st.total_successes += 1;
            match st.state {
                CircuitState::Closed => {
                    st.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    st.state = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.trial_in_flight = false;
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        consecutive_failures: 0,
                        cause: "trial_succeeded",
                    })
                }
                CircuitState::Open => {
                    tracing::debug!(
                        provider,
                        path = %path,
                        "Ignoring late success on open circuit"
                    );
                    None
                }
            }
        };

        if let Some(t) = transition {
            self.announce(provider, path, &t);
        }
    }

    /// Record a failed call (error or timeout)
    pub fn record_failure(&self, provider: &str, path: RoutePath) {
        let now = self.clock.now_ms();
        let threshold = self.config.read().failure_threshold.max(1);
        let circuits = self.circuits(provider);

        let transition = {
            let mut st = circuits.path(path).lock();
            st.total_failures += 1;
            st.last_failure_at = now;
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);

            match st.state {
                CircuitState::Closed if st.consecutive_failures >= threshold => {
                    st.state = CircuitState::Open;
                    st.opened_at = now;
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                        consecutive_failures: st.consecutive_failures,
                        cause: "failure_threshold",
                    })
                }
                CircuitState::Closed => None,
                CircuitState::HalfOpen => {
                    st.state = CircuitState::Open;
                    st.opened_at = now;
                    st.trial_in_flight = false;
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        consecutive_failures: st.consecutive_failures,
                        cause: "trial_failed",
                    })
                }
                // Cooldown runs from the moment the circuit opened
                CircuitState::Open => None,
            }
        };

        if let Some(t) = transition {
            self.announce(provider, path, &t);
        }
    }

    /// Give back a half-open trial that produced no outcome
    ///
    /// Used when the caller cancelled before the provider answered.
    pub fn release_trial(&self, provider: &str, path: RoutePath) {
        if let Some(circuits) = self.existing(provider) {
            let mut st = circuits.path(path).lock();
            if st.state == CircuitState::HalfOpen {
                st.trial_in_flight = false;
            }
        }
    }

    /// Stamp the time of a health probe
    pub fn record_probe(&self, provider: &str, path: RoutePath) {
        let now = self.clock.now_ms();
        self.circuits(provider).path(path).lock().last_probe_at = now;
    }

    /// Operator override of one breaker
    pub fn force_state(&self, provider: &str, path: RoutePath, state: CircuitState) {
        let now = self.clock.now_ms();
        let circuits = self.circuits(provider);

        let transition = {
            let mut st = circuits.path(path).lock();
            let from = st.state;
            st.state = state;
            st.trial_in_flight = false;
            match state {
                CircuitState::Closed => st.consecutive_failures = 0,
                CircuitState::Open => st.opened_at = now,
                CircuitState::HalfOpen => {}
            }
            (from != state).then_some(Transition {
                from,
                to: state,
                consecutive_failures: st.consecutive_failures,
                cause: "forced",
            })
        };

        if let Some(t) = transition {
            self.announce(provider, path, &t);
        }
    }

    /// Open both breakers of a provider
    pub fn force_open_provider(&self, provider: &str) {
        for path in RoutePath::ALL {
            self.force_state(provider, path, CircuitState::Open);
        }
    }

    /// Current state (unknown keys are closed)
    pub fn state(&self, provider: &str, path: RoutePath) -> CircuitState {
        self.existing(provider)
            .map_or(CircuitState::Closed, |c| c.path(path).lock().state)
    }

    /// Consecutive failures (unknown keys have none)
    pub fn consecutive_failures(&self, provider: &str, path: RoutePath) -> u32 {
        self.existing(provider)
            .map_or(0, |c| c.path(path).lock().consecutive_failures)
    }

    /// Whether every path of the provider is open
    pub fn all_open(&self, provider: &str) -> bool {
        RoutePath::ALL
            .iter()
            .all(|path| self.state(provider, *path) == CircuitState::Open)
    }

    /// Snapshot of one breaker
    pub fn snapshot_of(&self, provider: &str, path: RoutePath) -> CircuitSnapshot {
        let circuits = self.circuits(provider);
        let st = circuits.path(path).lock();
        Self::to_snapshot(provider, path, &st)
    }

    /// Snapshot of every breaker, ordered by provider then path
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut providers: Vec<(String, Arc<ProviderCircuits>)> = self
            .providers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        providers.sort_by(|a, b| a.0.cmp(&b.0));

        providers
            .iter()
            .flat_map(|(provider, circuits)| {
                RoutePath::ALL.into_iter().map(move |path| {
                    let st = circuits.path(path).lock();
                    Self::to_snapshot(provider, path, &st)
                })
            })
            .collect()
    }

    fn to_snapshot(provider: &str, path: RoutePath, st: &BreakerState) -> CircuitSnapshot {
        CircuitSnapshot {
            provider: provider.to_string(),
            path,
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            last_failure_at_ms: (st.last_failure_at != 0).then_some(st.last_failure_at),
            last_probe_at_ms: (st.last_probe_at != 0).then_some(st.last_probe_at),
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            rejections: st.rejections,
        }
    }

    fn cooldown_ms(&self) -> u64 {
        self.config.read().cooldown.as_millis() as u64
    }

    fn existing(&self, provider: &str) -> Option<Arc<ProviderCircuits>> {
        self.providers.get(provider).map(|c| c.clone())
    }

    fn circuits(&self, provider: &str) -> Arc<ProviderCircuits> {
        if let Some(c) = self.existing(provider) {
            return c;
        }
        self.providers
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    fn announce(&self, provider: &str, path: RoutePath, t: &Transition) {
        match t.to {
            CircuitState::Open => tracing::warn!(
                provider,
                path = %path,
                from = %t.from,
                consecutive_failures = t.consecutive_failures,
                cause = t.cause,
                "Circuit opened"
            ),
            CircuitState::Closed => tracing::info!(
                provider,
                path = %path,
                from = %t.from,
                cause = t.cause,
                "Circuit closed"
            ),
            CircuitState::HalfOpen => tracing::info!(
                provider,
                path = %path,
                cause = t.cause,
                "Circuit half-open, admitting one trial"
            ),
        }

        self.audit.emit(AuditEvent::new(
            AuditEventType::CircuitTransition,
            serde_json::json!({
                "provider": provider,
                "path": path,
                "from": t.from,
                "to": t.to,
                "consecutiveFailures": t.consecutive_failures,
                "cause": t.cause,
            }),
        ));
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("providers", &self.providers.len())
            .field("config", &self.config())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::routing::test_utils::MemoryAuditSink;

    fn registry() -> (CircuitBreakerRegistry, Arc<ManualClock>, Arc<MemoryAuditSink>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let audit = Arc::new(MemoryAuditSink::new());
        let registry =
            CircuitBreakerRegistry::new(BreakerConfig::default(), clock.clone(), audit.clone());
        (registry, clock, audit)
    }

    #[test]
    fn test_unknown_key_is_closed() {
        let (registry, _, _) = registry();
        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Closed);
        assert!(registry.admits("atlas", RoutePath::Direct));
        assert!(registry.is_available("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let (registry, _, audit) = registry();

        for _ in 0..4 {
            registry.record_failure("atlas", RoutePath::Direct);
            assert!(registry.is_available("atlas", RoutePath::Direct));
        }
        registry.record_failure("atlas", RoutePath::Direct);

        assert!(!registry.is_available("atlas", RoutePath::Direct));
        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Open);
        assert_eq!(audit.count(AuditEventType::CircuitTransition), 1);

        // Other path is independent
        assert!(registry.is_available("atlas", RoutePath::Brokered));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (registry, _, _) = registry();

        for _ in 0..4 {
            registry.record_failure("atlas", RoutePath::Brokered);
        }
        registry.record_success("atlas", RoutePath::Brokered);
        assert_eq!(registry.consecutive_failures("atlas", RoutePath::Brokered), 0);

        for _ in 0..4 {
            registry.record_failure("atlas", RoutePath::Brokered);
        }
        assert!(registry.is_available("atlas", RoutePath::Brokered));
    }

    #[test]
    fn test_cooldown_admits_exactly_one_trial() {
        let (registry, clock, _) = registry();
        registry.force_state("atlas", RoutePath::Direct, CircuitState::Open);

        clock.advance(Duration::from_secs(59));
        assert!(!registry.is_available("atlas", RoutePath::Direct));

        clock.advance(Duration::from_secs(1));
        assert!(registry.admits("atlas", RoutePath::Direct));
        assert!(registry.is_available("atlas", RoutePath::Direct));
        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::HalfOpen);

        // Trial taken
        assert!(!registry.is_available("atlas", RoutePath::Direct));
        assert!(!registry.admits("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_failed_trial_reopens_and_resets_cooldown() {
        let (registry, clock, _) = registry();
        registry.force_state("atlas", RoutePath::Direct, CircuitState::Open);

        clock.advance(Duration::from_secs(60));
        assert!(registry.is_available("atlas", RoutePath::Direct));
        registry.record_failure("atlas", RoutePath::Direct);

        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Open);
        clock.advance(Duration::from_secs(30));
        assert!(!registry.is_available("atlas", RoutePath::Direct));
        clock.advance(Duration::from_secs(30));
        assert!(registry.is_available("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_successful_trial_closes() {
        let (registry, clock, _) = registry();
        for _ in 0..5 {
            registry.record_failure("atlas", RoutePath::Direct);
        }

        clock.advance(Duration::from_secs(60));
        assert!(registry.is_available("atlas", RoutePath::Direct));
        registry.record_success("atlas", RoutePath::Direct);

        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Closed);
        assert_eq!(registry.consecutive_failures("atlas", RoutePath::Direct), 0);
        assert!(registry.is_available("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_failures_while_open_do_not_extend_cooldown() {
        let (registry, clock, _) = registry();
        registry.force_state("atlas", RoutePath::Direct, CircuitState::Open);

        clock.advance(Duration::from_secs(50));
        registry.record_failure("atlas", RoutePath::Direct);
        clock.advance(Duration::from_secs(10));

        assert!(registry.is_available("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_late_success_while_open_is_ignored() {
        let (registry, _, _) = registry();
        registry.force_state("atlas", RoutePath::Direct, CircuitState::Open);
        registry.record_success("atlas", RoutePath::Direct);
        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Open);
    }

    #[test]
    fn test_release_trial() {
        let (registry, clock, _) = registry();
        registry.force_state("atlas", RoutePath::Direct, CircuitState::Open);
        clock.advance(Duration::from_secs(60));

        assert!(registry.is_available("atlas", RoutePath::Direct));
        registry.release_trial("atlas", RoutePath::Direct);
        assert!(registry.is_available("atlas", RoutePath::Direct));
    }

    #[test]
    fn test_live_config_change() {
        let (registry, _, _) = registry();
        registry.set_config(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(10),
        });

        registry.record_failure("atlas", RoutePath::Direct);
        registry.record_failure("atlas", RoutePath::Direct);
        assert_eq!(registry.state("atlas", RoutePath::Direct), CircuitState::Open);
    }

    #[test]
    fn test_force_open_provider_and_snapshot() {
        let (registry, _, _) = registry();
        registry.register("sage");
        registry.force_open_provider("atlas");

        assert!(registry.all_open("atlas"));
        assert!(!registry.all_open("sage"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].provider, "atlas");
        assert_eq!(snapshot[0].path, RoutePath::Direct);
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[2].provider, "sage");
    }

    #[test]
    fn test_record_probe_stamps_time() {
        let (registry, clock, _) = registry();
        clock.set(5_000);
        registry.record_probe("atlas", RoutePath::Brokered);
        assert_eq!(
            registry.snapshot_of("atlas", RoutePath::Brokered).last_probe_at_ms,
            Some(5_000)
        );
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let (registry, _, audit) = registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        r.record_failure("atlas", RoutePath::Direct);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.consecutive_failures("atlas", RoutePath::Direct), 80);
        assert_eq!(audit.count(AuditEventType::CircuitTransition), 1);
    }
}
