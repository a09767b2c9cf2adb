//! Health Monitor
//!
//! Periodic background loop. Each cycle:
//!
//! 1. Probes every enabled `(provider, path)` concurrently, with a bounded
//!    timeout per probe. Results feed the circuit breaker; latency goes to
//!    the synthetic counter, never the real-traffic windows.
//! 2. Scores routing efficiency per task class from recent real traffic.
//! 3. Flags bottleneck providers on the shared [`HealthBoard`], where the
//!    optimizer picks them up.
//! 4. Escalates SLO erosion to audit and logs.
//! 5. Demotes an alternate whose circuits stayed open for several
//!    consecutive cycles.
//!
//! A probe only feeds a breaker that would admit traffic. A cooling open
//! circuit is probed for latency but keeps its cooldown; once cooled, the
//! probe takes the half-open trial and its outcome closes or re-opens it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::provider::{ProviderEntry, ProviderErrorKind};
use crate::request::RoutePath;
use crate::routing::classifier::TaskClass;
use crate::routing::router::RouterState;
use crate::routing::rules::RuleAuthor;
use crate::routing::telemetry::{OperationClass, SloStatus};
use crate::sinks::{AuditEvent, AuditEventType};

// ============================================================================
// Configuration
// ============================================================================

/// Health monitor settings
#[derive(Clone, Debug, PartialEq)]
pub struct HealthMonitorConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Bound on each probe
    pub probe_timeout: Duration,
    /// Real-traffic lookback for scores and bottlenecks
    pub lookback: Duration,
    /// Consecutive all-open cycles before an alternate is demoted
    pub demotion_cycles: u32,
    /// Success rate below which a provider is a bottleneck
    pub bottleneck_success_rate: f64,
    /// Samples needed before traffic stats can flag a bottleneck
    pub bottleneck_min_samples: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            lookback: Duration::from_secs(15 * 60),
            demotion_cycles: 3,
            bottleneck_success_rate: 0.90,
            bottleneck_min_samples: 20,
        }
    }
}

// ============================================================================
// Report Types
// ============================================================================

/// Outcome of one probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub provider: String,
    pub path: RoutePath,
    pub ok: bool,
    pub latency_ms: u64,
    /// Whether the result was fed to the breaker
    pub recorded: bool,
}

/// Routing efficiency of one task class
///
/// `score = 0.5 * primary_hit_rate + 0.3 * success_rate + 0.2 * latency_score`
/// where `latency_score` is how far mean latency sits under the generation
/// objective, clamped to `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyScore {
    pub task_class: TaskClass,
    pub requests: usize,
    pub primary_hit_rate: f64,
    pub success_rate: f64,
    pub latency_score: f64,
    pub score: f64,
}

/// Why a provider was flagged
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BottleneckReason {
    /// Every path circuit is open
    CircuitsOpen,
    /// Success rate under the configured floor
    LowSuccessRate,
    /// P95 over the latency objective
    SlowP95,
}

impl fmt::Display for BottleneckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitsOpen => f.write_str("circuits-open"),
            Self::LowSuccessRate => f.write_str("low-success-rate"),
            Self::SlowP95 => f.write_str("slow-p95"),
        }
    }
}

/// A provider flagged for the optimizer
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub provider: String,
    pub reason: BottleneckReason,
    /// Consecutive cycles the provider has been flagged
    pub cycles: u32,
}

/// A rule change made by the monitor
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Demotion {
    pub task_class: TaskClass,
    pub provider: String,
    pub version: u64,
}

/// Result of one cycle
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub probes: Vec<ProbeResult>,
    pub efficiency: Vec<EfficiencyScore>,
    pub bottlenecks: Vec<Bottleneck>,
    pub slo: BTreeMap<String, SloStatus>,
    pub demotions: Vec<Demotion>,
}

// ============================================================================
// Shared Board
// ============================================================================

/// Latest monitor findings, read by the optimizer
#[derive(Debug, Default)]
pub struct HealthBoard {
    latest: RwLock<Option<Arc<HealthReport>>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent report
    pub fn latest(&self) -> Option<Arc<HealthReport>> {
        self.latest.read().clone()
    }

    /// Providers currently flagged
    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        self.latest
            .read()
            .as_ref()
            .map(|r| r.bottlenecks.clone())
            .unwrap_or_default()
    }

    /// Whether a provider is currently flagged
    pub fn is_bottleneck(&self, provider: &str) -> bool {
        self.latest
            .read()
            .as_ref()
            .is_some_and(|r| r.bottlenecks.iter().any(|b| b.provider == provider))
    }

    /// Efficiency score of a class from the latest cycle
    pub fn efficiency(&self, task_class: TaskClass) -> Option<EfficiencyScore> {
        self.latest.read().as_ref().and_then(|r| {
            r.efficiency
                .iter()
                .find(|e| e.task_class == task_class)
                .cloned()
        })
    }

    fn publish(&self, report: Arc<HealthReport>) {
        *self.latest.write() = Some(report);
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Periodic prober and rule demoter
pub struct HealthMonitor {
    state: RouterState,
    board: Arc<HealthBoard>,
    config: RwLock<HealthMonitorConfig>,
    cycles: AtomicU64,
    /// Consecutive cycles each provider had every circuit open
    open_streaks: Mutex<HashMap<String, u32>>,
    /// Consecutive cycles each provider was flagged
    flag_streaks: Mutex<HashMap<String, u32>>,
    /// Last reported SLO status per operation class
    slo_status: Mutex<HashMap<OperationClass, SloStatus>>,
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(state: RouterState, board: Arc<HealthBoard>, config: HealthMonitorConfig) -> Self {
        Self {
            state,
            board,
            config: RwLock::new(config),
            cycles: AtomicU64::new(0),
            open_streaks: Mutex::new(HashMap::new()),
            flag_streaks: Mutex::new(HashMap::new()),
            slo_status: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> HealthMonitorConfig {
        self.config.read().clone()
    }

    /// Replace settings; the interval applies from the next spawn
    pub fn set_config(&self, config: HealthMonitorConfig) {
        *self.config.write() = config;
    }

    /// Shared findings
    pub fn board(&self) -> &Arc<HealthBoard> {
        &self.board
    }

    /// Run one full cycle
    pub async fn run_once(&self) -> Arc<HealthReport> {
        let config = self.config();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        let probes = self.probe_all(config.probe_timeout).await;
        let efficiency = self.score_efficiency(&config);
        let bottlenecks = self.flag_bottlenecks(&config);
        let slo = self.check_slo();
        let demotions = self.demote_stuck_alternates(&config);

        let failed = probes.iter().filter(|p| !p.ok).count();
        tracing::debug!(
            cycle,
            probes = probes.len(),
            failed,
            bottlenecks = bottlenecks.len(),
            demotions = demotions.len(),
            "Health cycle complete"
        );

        let report = Arc::new(HealthReport {
            cycle,
            generated_at: Utc::now(),
            probes,
            efficiency,
            bottlenecks,
            slo,
            demotions,
        });
        self.board.publish(report.clone());
        report
    }

    /// Run cycles until `shutdown` flips to `true`
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config().interval;
            tracing::info!(interval_secs = interval.as_secs(), "Starting health monitor");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }

    // ------------------------------------------------------------------------
    // Probing
    // ------------------------------------------------------------------------

    async fn probe_all(&self, timeout: Duration) -> Vec<ProbeResult> {
        let entries = self.state.registry.entries();
        let probes = entries
            .iter()
            .filter(|entry| entry.is_enabled())
            .flat_map(|entry| {
                RoutePath::ALL
                    .into_iter()
                    .map(move |path| self.probe_one(entry.identity.id.as_str(), entry, path, timeout))
            });
        join_all(probes).await
    }

    async fn probe_one(
        &self,
        provider: &str,
        entry: &ProviderEntry,
        path: RoutePath,
        timeout: Duration,
    ) -> ProbeResult {
        let circuits = &self.state.circuits;
        let recorded = circuits.is_available(provider, path);
        circuits.record_probe(provider, path);

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, entry.adapter.probe(path, timeout)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let failure_kind = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.kind),
            Err(_) => Some(ProviderErrorKind::Timeout),
        };
        let ok = failure_kind.is_none();
        self.state
            .telemetry
            .record_synthetic(provider, path, latency_ms, ok);

        if recorded {
            match failure_kind {
                None => circuits.record_success(provider, path),
                Some(kind) if kind.counts_against_health() => {
                    circuits.record_failure(provider, path)
                }
                Some(_) => circuits.release_trial(provider, path),
            }
        }

        if let Some(kind) = failure_kind {
            tracing::debug!(provider, path = %path, kind = %kind, latency_ms, "Probe failed");
        }

        ProbeResult {
            provider: provider.to_string(),
            path,
            ok,
            latency_ms,
            recorded,
        }
    }

    // ------------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------------

    fn score_efficiency(&self, config: &HealthMonitorConfig) -> Vec<EfficiencyScore> {
        let telemetry = &self.state.telemetry;
        let since = telemetry.now_ms().saturating_sub(config.lookback.as_millis() as u64);
        let objective_ms = telemetry.config().slo.objective(OperationClass::Generation).as_millis() as f64;

        TaskClass::ALL
            .into_iter()
            .filter_map(|task_class| {
                let stats = telemetry.class_stats(task_class, since);
                if stats.requests == 0 {
                    return None;
                }
                let latency_score = if objective_ms > 0.0 {
                    (1.0 - stats.mean_latency_ms / objective_ms).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let score = 0.5 * stats.primary_hit_rate
                    + 0.3 * stats.success_rate
                    + 0.2 * latency_score;
                Some(EfficiencyScore {
                    task_class,
                    requests: stats.requests,
                    primary_hit_rate: stats.primary_hit_rate,
                    success_rate: stats.success_rate,
                    latency_score,
                    score,
                })
            })
            .collect()
    }

    fn flag_bottlenecks(&self, config: &HealthMonitorConfig) -> Vec<Bottleneck> {
        let telemetry = &self.state.telemetry;
        let since = telemetry.now_ms().saturating_sub(config.lookback.as_millis() as u64);
        let objective_ms = telemetry.config().slo.objective(OperationClass::Generation).as_millis() as u64;

        let mut flagged = Vec::new();
        for provider in self.state.registry.ids() {
            let reason = if self.state.circuits.all_open(&provider) {
                Some(BottleneckReason::CircuitsOpen)
            } else {
                let stats = telemetry.provider_stats(&provider, since);
                if stats.samples < config.bottleneck_min_samples {
                    None
                } else if stats.success_rate < config.bottleneck_success_rate {
                    Some(BottleneckReason::LowSuccessRate)
                } else if stats.p95_ms > objective_ms {
                    Some(BottleneckReason::SlowP95)
                } else {
                    None
                }
            };
            flagged.push((provider, reason));
        }

        let mut streaks = self.flag_streaks.lock();
        let mut bottlenecks = Vec::new();
        for (provider, reason) in flagged {
            match reason {
                Some(reason) => {
                    let cycles = streaks.entry(provider.clone()).or_insert(0);
                    *cycles += 1;
                    if *cycles == 1 {
                        tracing::info!(provider = %provider, reason = %reason, "Bottleneck provider flagged");
                        self.state.audit.emit(AuditEvent::new(
                            AuditEventType::BottleneckFlagged,
                            serde_json::json!({ "provider": provider, "reason": reason }),
                        ));
                    }
                    bottlenecks.push(Bottleneck {
                        provider,
                        reason,
                        cycles: *cycles,
                    });
                }
                None => {
                    streaks.remove(&provider);
                }
            }
        }
        bottlenecks
    }

    fn check_slo(&self) -> BTreeMap<String, SloStatus> {
        let telemetry = &self.state.telemetry;
        let mut last = self.slo_status.lock();
        let mut out = BTreeMap::new();

        for class in OperationClass::REAL {
            let status = telemetry.slo_status(class);
            let previous = last.insert(class, status).unwrap_or(SloStatus::Ok);
            out.insert(format!("{class:?}").to_ascii_lowercase(), status);

            if status == previous {
                continue;
            }
            let (short, long) = telemetry.burn_rates(class);
            match status {
                SloStatus::Ok => {
                    tracing::info!(operation_class = ?class, "SLO burn back within budget");
                }
                SloStatus::Warning | SloStatus::Critical => {
                    tracing::warn!(
                        operation_class = ?class,
                        status = %status,
                        short_burn = short,
                        long_burn = long,
                        "SLO erosion"
                    );
                }
            }
            self.state.audit.emit(AuditEvent::new(
                AuditEventType::SloErosion,
                serde_json::json!({
                    "operationClass": class,
                    "status": status,
                    "previousStatus": previous,
                    "shortHorizonBurn": short,
                    "longHorizonBurn": long,
                }),
            ));
        }
        out
    }

    // ------------------------------------------------------------------------
    // Demotion
    // ------------------------------------------------------------------------

    fn demote_stuck_alternates(&self, config: &HealthMonitorConfig) -> Vec<Demotion> {
        let due: Vec<String> = {
            let mut streaks = self.open_streaks.lock();
            let mut due = Vec::new();
            for provider in self.state.registry.ids() {
                if self.state.circuits.all_open(&provider) {
                    let cycles = streaks.entry(provider.clone()).or_insert(0);
                    *cycles += 1;
                    if *cycles == config.demotion_cycles.max(1) {
                        due.push(provider);
                    }
                } else {
                    streaks.remove(&provider);
                }
            }
            due
        };

        let mut demotions = Vec::new();
        for provider in due {
            for task_class in TaskClass::ALL {
                if let Some(demotion) = self.demote(task_class, &provider) {
                    demotions.push(demotion);
                }
            }
        }
        demotions
    }

    /// Move an alternate to the end of a class chain
    fn demote(&self, task_class: TaskClass, provider: &str) -> Option<Demotion> {
        let active = self.state.rules.active(task_class);
        let chain = &active.rule.ordered_provider_chain;
        let position = chain.iter().position(|p| p == provider)?;
        // The primary is never demoted here, only alternates
        if position == 0 || position == chain.len() - 1 {
            return None;
        }

        let mut rule = active.rule.clone();
        let moved = rule.ordered_provider_chain.remove(position);
        rule.ordered_provider_chain.push(moved);

        match self.state.rules.compare_and_swap(
            active.version,
            rule,
            RuleAuthor::HealthMonitor,
            format!("{provider} circuits open for consecutive health cycles"),
        ) {
            Ok(version) => {
                tracing::warn!(
                    task_class = %task_class,
                    provider,
                    version = version.version,
                    "Demoted alternate with open circuits"
                );
                Some(Demotion {
                    task_class,
                    provider: provider.to_string(),
                    version: version.version,
                })
            }
            Err(err) => {
                tracing::debug!(task_class = %task_class, provider, error = %err, "Demotion skipped");
                None
            }
        }
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &*self.config.read())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}
