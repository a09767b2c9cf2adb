//! Routing Efficiency Optimizer
//!
//! Slow background control loop that tunes routing rules from observed
//! telemetry and undoes its own changes when they make things worse.
//!
//! ```text
//! evaluate matured changes -> confirm | roll back
//! snapshot provider stats (lookback window)
//! per task class with enough samples:
//!     weigh metrics (strategy) -> search rule deltas -> safety checks
//! apply the best few (bounded per cycle) as versioned swaps
//! ```
//!
//! # Chain model
//!
//! Fallback is sequential, so position `i` of a chain is reached only when
//! every earlier provider failed:
//!
//! ```text
//! reach(0) = 1
//! reach(i) = reach(i-1) * (1 - success(i-1))
//! success  = 1 - prod(1 - success(i))
//! latency  = sum(reach(i) * latency(i))
//! cost     = sum(reach(i) * success(i) * cost(i))
//! ```
//!
//! Expected improvement of a delta is the model's relative change on the
//! targeted metric.
//!
//! # Safety
//!
//! A delta may reorder providers or widen urgency thresholds. It may never
//! drop a provider, move a pinned primary, promote a flagged bottleneck,
//! or push a threshold outside the configured bounds. One change per task
//! class is observed at a time; the rollback compares against the version
//! the optimizer itself installed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::request::UrgencyTier;
use crate::routing::classifier::TaskClass;
use crate::routing::error::RoutingError;
use crate::routing::health::HealthBoard;
use crate::routing::router::RouterState;
use crate::routing::rules::{RoutingRule, RuleAuthor, RuleError, UrgencyThresholds};
use crate::routing::telemetry::{ClassStats, ProviderStats};
use crate::sinks::{AuditEvent, AuditEventType};

/// Recommendations kept for audit
const HISTORY_LIMIT: usize = 128;

/// Observation windows to wait for traffic before confirming blind
const MAX_IDLE_WINDOWS: u64 = 3;

// ============================================================================
// Configuration
// ============================================================================

/// How candidate deltas are weighed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationStrategy {
    LatencyFirst,
    SuccessRateFirst,
    CostEfficient,
    Balanced,
    /// Weights follow whichever metric is furthest from its target
    #[default]
    Adaptive,
}

impl std::str::FromStr for OptimizationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "latency-first" | "latency" => Ok(Self::LatencyFirst),
            "success-rate-first" | "success-rate" => Ok(Self::SuccessRateFirst),
            "cost-efficient" | "cost" => Ok(Self::CostEfficient),
            "balanced" => Ok(Self::Balanced),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown optimization strategy '{other}'")),
        }
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatencyFirst => f.write_str("latency-first"),
            Self::SuccessRateFirst => f.write_str("success-rate-first"),
            Self::CostEfficient => f.write_str("cost-efficient"),
            Self::Balanced => f.write_str("balanced"),
            Self::Adaptive => f.write_str("adaptive"),
        }
    }
}

/// Optimizer settings (operator-mutable)
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Samples required per affected provider
    pub min_samples: usize,
    /// Rule changes per cycle
    pub max_changes_per_cycle: usize,
    /// Allowed regression of the targeted metric (fraction)
    pub regression_tolerance: f64,
    /// Allowed regression of the other metrics (fraction)
    pub collateral_tolerance: f64,
    /// Time a change runs before it is judged
    pub observation_window: Duration,
    /// Telemetry window used for snapshots
    pub lookback: Duration,
    pub strategy: OptimizationStrategy,
    /// Smallest modelled improvement worth a change (fraction)
    pub min_improvement: f64,
    pub latency_target_ms: u64,
    pub success_rate_target: f64,
    pub cost_target_usd: f64,
    /// Lower bound for any urgency threshold
    pub min_threshold_ms: u64,
    /// Upper bound for any urgency threshold
    pub max_threshold_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            min_samples: 100,
            max_changes_per_cycle: 3,
            regression_tolerance: 0.05,
            collateral_tolerance: 0.10,
            observation_window: Duration::from_secs(10 * 60),
            lookback: Duration::from_secs(60 * 60),
            strategy: OptimizationStrategy::Adaptive,
            min_improvement: 0.02,
            latency_target_ms: 5_000,
            success_rate_target: 0.99,
            cost_target_usd: 0.01,
            min_threshold_ms: 1_000,
            max_threshold_ms: 120_000,
        }
    }
}

// ============================================================================
// Metrics Model
// ============================================================================

/// Metric an optimization aims at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetMetric {
    Latency,
    SuccessRate,
    Cost,
}

impl TargetMetric {
    pub const ALL: [TargetMetric; 3] = [Self::Latency, Self::SuccessRate, Self::Cost];
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latency => f.write_str("latency"),
            Self::SuccessRate => f.write_str("success-rate"),
            Self::Cost => f.write_str("cost"),
        }
    }
}

/// The three optimized metrics
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub latency_ms: f64,
    pub success_rate: f64,
    pub cost_usd: f64,
    /// Requests behind the numbers (zero for modelled values)
    pub requests: usize,
}

impl MetricSnapshot {
    fn from_class(stats: &ClassStats) -> Self {
        Self {
            latency_ms: stats.mean_latency_ms,
            success_rate: stats.success_rate,
            cost_usd: stats.cost_per_request,
            requests: stats.requests,
        }
    }

    /// Relative improvement of `self` over `base` on one metric
    ///
    /// Positive is better. Zero baselines give zero.
    fn improvement_over(&self, base: &MetricSnapshot, metric: TargetMetric) -> f64 {
        let (new, old, higher_is_better) = match metric {
            TargetMetric::Latency => (self.latency_ms, base.latency_ms, false),
            TargetMetric::SuccessRate => (self.success_rate, base.success_rate, true),
            TargetMetric::Cost => (self.cost_usd, base.cost_usd, false),
        };
        if old <= f64::EPSILON {
            return 0.0;
        }
        if higher_is_better {
            (new - old) / old
        } else {
            (old - new) / old
        }
    }
}

/// Per-metric weights, summing to one
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricWeights {
    pub latency: f64,
    pub success_rate: f64,
    pub cost: f64,
}

impl MetricWeights {
    const BALANCED: Self = Self {
        latency: 1.0 / 3.0,
        success_rate: 1.0 / 3.0,
        cost: 1.0 / 3.0,
    };

    fn get(&self, metric: TargetMetric) -> f64 {
        match metric {
            TargetMetric::Latency => self.latency,
            TargetMetric::SuccessRate => self.success_rate,
            TargetMetric::Cost => self.cost,
        }
    }

    /// Heaviest metric; ties go to success rate, then latency
    fn dominant(&self) -> TargetMetric {
        let mut best = TargetMetric::SuccessRate;
        for metric in [TargetMetric::Latency, TargetMetric::Cost] {
            if self.get(metric) > self.get(best) + f64::EPSILON {
                best = metric;
            }
        }
        best
    }

    /// Metric contributing most to a candidate's weighted gain
    fn leading_gain(&self, candidate: &MetricSnapshot, base: &MetricSnapshot) -> TargetMetric {
        let contribution = |m: TargetMetric| self.get(m) * candidate.improvement_over(base, m);
        let mut best = self.dominant();
        for metric in TargetMetric::ALL {
            if contribution(metric) > contribution(best) + f64::EPSILON {
                best = metric;
            }
        }
        best
    }

    fn score(&self, candidate: &MetricSnapshot, base: &MetricSnapshot) -> f64 {
        TargetMetric::ALL
            .iter()
            .map(|m| self.get(*m) * candidate.improvement_over(base, *m))
            .sum()
    }

    /// Weights of a strategy for a class at `baseline`
    pub fn for_strategy(
        strategy: OptimizationStrategy,
        baseline: &MetricSnapshot,
        config: &OptimizerConfig,
    ) -> Self {
        match strategy {
            OptimizationStrategy::LatencyFirst => Self {
                latency: 1.0,
                success_rate: 0.0,
                cost: 0.0,
            },
            OptimizationStrategy::SuccessRateFirst => Self {
                latency: 0.0,
                success_rate: 1.0,
                cost: 0.0,
            },
            OptimizationStrategy::CostEfficient => Self {
                latency: 0.0,
                success_rate: 0.0,
                cost: 1.0,
            },
            OptimizationStrategy::Balanced => Self::BALANCED,
            OptimizationStrategy::Adaptive => {
                let gap = |observed: f64, target: f64, higher_is_better: bool| {
                    if target <= f64::EPSILON {
                        return 0.0;
                    }
                    let gap = if higher_is_better {
                        (target - observed) / target
                    } else {
                        (observed - target) / target
                    };
                    gap.max(0.0)
                };
                let latency = gap(baseline.latency_ms, config.latency_target_ms as f64, false);
                let success_rate = gap(baseline.success_rate, config.success_rate_target, true);
                let cost = gap(baseline.cost_usd, config.cost_target_usd, false);
                let total = latency + success_rate + cost;
                if total <= f64::EPSILON {
                    Self::BALANCED
                } else {
                    Self {
                        latency: latency / total,
                        success_rate: success_rate / total,
                        cost: cost / total,
                    }
                }
            }
        }
    }
}

/// Modelled metrics of a chain from per-provider stats
///
/// Providers without stats are skipped; they are never reached in the model.
pub fn model_chain(chain: &[String], stats: &HashMap<String, ProviderStats>) -> MetricSnapshot {
    let mut reach = 1.0;
    let mut latency = 0.0;
    let mut cost = 0.0;

    for provider in chain {
        let Some(s) = stats.get(provider) else {
            continue;
        };
        latency += reach * s.mean_latency_ms;
        cost += reach * s.success_rate * s.cost_per_request;
        reach *= 1.0 - s.success_rate;
    }

    MetricSnapshot {
        latency_ms: latency,
        success_rate: 1.0 - reach,
        cost_usd: cost,
        requests: 0,
    }
}

// ============================================================================
// Recommendations
// ============================================================================

/// Lifecycle of a recommendation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationStatus {
    /// Generated, not applied
    Proposed,
    /// Active rule, under observation
    Applied,
    /// Survived its observation window
    Confirmed,
    /// Reverted after a regression
    RolledBack,
    /// Failed a safety check, lost a version race, or exceeded the
    /// per-cycle change limit
    Rejected,
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed => f.write_str("proposed"),
            Self::Applied => f.write_str("applied"),
            Self::Confirmed => f.write_str("confirmed"),
            Self::RolledBack => f.write_str("rolled-back"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// Proposed change to a rule
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDelta {
    /// New provider order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_chain: Option<Vec<String>>,
    /// New urgency thresholds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urgency_thresholds: Option<UrgencyThresholds>,
}

impl RuleDelta {
    fn apply_to(&self, rule: &RoutingRule) -> RoutingRule {
        let mut next = rule.clone();
        if let Some(chain) = &self.provider_chain {
            next.ordered_provider_chain = chain.clone();
        }
        if let Some(thresholds) = &self.urgency_thresholds {
            next.urgency_thresholds = *thresholds;
        }
        next
    }
}

/// One optimizer proposal and its fate
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRecommendation {
    pub id: Uuid,
    pub task_class: TaskClass,
    pub strategy: OptimizationStrategy,
    pub target_metric: TargetMetric,
    pub proposed_rule_delta: RuleDelta,
    /// Modelled gain on the target metric, in percent
    pub expected_improvement_pct: f64,
    /// Observed class metrics when proposed
    pub baseline: MetricSnapshot,
    /// Rule version the delta was computed against
    pub base_version: u64,
    /// Version installed by the change
    pub applied_version: Option<u64>,
    pub status: RecommendationStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub evaluated_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Observed class metrics over the observation window
    pub observed: Option<MetricSnapshot>,
    pub note: Option<String>,
    #[serde(skip)]
    applied_at_ms: u64,
    #[serde(skip)]
    settled_at_ms: u64,
}

/// Outcome of one cycle
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationCycle {
    pub cycle: u64,
    /// Optimizer switched off by toggle
    pub disabled: bool,
    pub applied: Vec<Uuid>,
    pub confirmed: Vec<Uuid>,
    pub rolled_back: Vec<Uuid>,
    pub rejected: Vec<Uuid>,
    /// Classes without enough samples this cycle
    pub insufficient: Vec<TaskClass>,
}

impl OptimizationCycle {
    /// Rule changes made by this cycle, rollbacks included
    pub fn rule_changes(&self) -> usize {
        self.applied.len() + self.rolled_back.len()
    }
}

#[derive(Debug, Default)]
struct Ledger {
    history: VecDeque<OptimizationRecommendation>,
}

impl Ledger {
    fn push(&mut self, rec: OptimizationRecommendation) {
        self.history.push_back(rec);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn pending(&self, task_class: TaskClass) -> bool {
        self.history
            .iter()
            .any(|r| r.task_class == task_class && r.status == RecommendationStatus::Applied)
    }

    /// A class whose change was reverted is left alone for `hold_ms`
    fn cooling(&self, task_class: TaskClass, now_ms: u64, hold_ms: u64) -> bool {
        self.history.iter().any(|r| {
            r.task_class == task_class
                && r.status == RecommendationStatus::RolledBack
                && now_ms.saturating_sub(r.settled_at_ms) < hold_ms
        })
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Self-tuning rule optimizer
pub struct RoutingOptimizer {
    state: RouterState,
    board: Arc<HealthBoard>,
    config: RwLock<OptimizerConfig>,
    ledger: Mutex<Ledger>,
    cycles: AtomicU64,
}

impl RoutingOptimizer {
    /// Create an optimizer
    pub fn new(state: RouterState, board: Arc<HealthBoard>, config: OptimizerConfig) -> Self {
        Self {
            state,
            board,
            config: RwLock::new(config),
            ledger: Mutex::new(Ledger::default()),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> OptimizerConfig {
        self.config.read().clone()
    }

    /// Replace settings; applies from the next cycle
    pub fn set_config(&self, config: OptimizerConfig) {
        tracing::info!(
            interval_secs = config.interval.as_secs(),
            min_samples = config.min_samples,
            max_changes = config.max_changes_per_cycle,
            strategy = %config.strategy,
            "Optimizer configuration updated"
        );
        *self.config.write() = config;
    }

    /// Recommendation history, oldest first
    pub fn recommendations(&self) -> Vec<OptimizationRecommendation> {
        self.ledger.lock().history.iter().cloned().collect()
    }

    /// Look up one recommendation
    pub fn recommendation(&self, id: Uuid) -> Option<OptimizationRecommendation> {
        self.ledger.lock().history.iter().find(|r| r.id == id).cloned()
    }

    /// Run one cycle
    pub fn run_once(&self) -> OptimizationCycle {
        let cycle_no = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut cycle = OptimizationCycle {
            cycle: cycle_no,
            ..OptimizationCycle::default()
        };

        if !self.state.toggles.optimizer_enabled() {
            cycle.disabled = true;
            tracing::debug!(cycle = cycle_no, "Optimizer disabled, skipping cycle");
            return cycle;
        }

        let config = self.config();
        self.evaluate_pending(&config, &mut cycle);

        let now = self.state.telemetry.now_ms();
        let since = now.saturating_sub(config.lookback.as_millis() as u64);
        let mut candidates = Vec::new();

        let hold_ms = config.lookback.as_millis() as u64;
        for task_class in TaskClass::ALL {
            {
                let ledger = self.ledger.lock();
                if ledger.pending(task_class) || ledger.cooling(task_class, now, hold_ms) {
                    continue;
                }
            }
            match self.propose(task_class, since, &config) {
                Ok(Some(rec)) => candidates.push(rec),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(task_class = %task_class, reason = %err, "Optimization skipped");
                    cycle.insufficient.push(task_class);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.expected_improvement_pct
                .partial_cmp(&a.expected_improvement_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for rec in candidates {
            if cycle.applied.len() >= config.max_changes_per_cycle {
                // Proposals are rebuilt from fresh telemetry every cycle
                self.reject(rec, "per-cycle change limit reached".into(), &mut cycle);
                continue;
            }
            match self.safety_check(&rec, &config) {
                Ok(()) => self.apply(rec, now, &mut cycle),
                Err(reason) => self.reject(rec, reason, &mut cycle),
            }
        }

        tracing::info!(
            cycle = cycle_no,
            applied = cycle.applied.len(),
            confirmed = cycle.confirmed.len(),
            rolled_back = cycle.rolled_back.len(),
            rejected = cycle.rejected.len(),
            insufficient = cycle.insufficient.len(),
            "Optimizer cycle complete"
        );
        cycle
    }

    /// Run cycles until `shutdown` flips to `true`
    ///
    /// The interval is re-read before every wait, so live changes apply
    /// from the next cycle.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.config().interval.as_secs(),
                "Starting routing optimizer"
            );
            loop {
                let interval = self.config().interval;
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        self.run_once();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Routing optimizer stopped");
        })
    }

    // ------------------------------------------------------------------------
    // Proposal
    // ------------------------------------------------------------------------

    fn propose(
        &self,
        task_class: TaskClass,
        since: u64,
        config: &OptimizerConfig,
    ) -> Result<Option<OptimizationRecommendation>, RoutingError> {
        let telemetry = &self.state.telemetry;
        let active = self.state.rules.active(task_class);
        let chain: Vec<String> = active
            .rule
            .ordered_provider_chain
            .iter()
            .filter(|p| self.state.registry.is_enabled(p))
            .cloned()
            .collect();

        // Every operation class a reachable provider served must be well
        // sampled, and every provider must have served something
        let mut stats = HashMap::new();
        for provider in &chain {
            let counts = telemetry.sample_counts(provider, since);
            let have = counts
                .iter()
                .map(|(_, n)| *n)
                .filter(|n| *n > 0)
                .min()
                .unwrap_or(0);
            if have < config.min_samples {
                return Err(RoutingError::InsufficientTelemetry {
                    have,
                    need: config.min_samples,
                });
            }
            stats.insert(provider.clone(), telemetry.provider_stats(provider, since));
        }
        if stats.is_empty() {
            return Err(RoutingError::InsufficientTelemetry {
                have: 0,
                need: config.min_samples,
            });
        }

        let class_stats = telemetry.class_stats(task_class, since);
        let baseline = if class_stats.requests > 0 {
            MetricSnapshot::from_class(&class_stats)
        } else {
            model_chain(&active.rule.ordered_provider_chain, &stats)
        };
        let weights = MetricWeights::for_strategy(config.strategy, &baseline, config);

        let pinned = self.state.policy.is_pinned(task_class);
        let bottlenecks: Vec<String> = self
            .board
            .bottlenecks()
            .into_iter()
            .map(|b| b.provider)
            .collect();

        let current = &active.rule.ordered_provider_chain;
        let modelled_now = model_chain(current, &stats);

        // (score, delta, target, gain on target)
        let mut best: Option<(f64, RuleDelta, TargetMetric, f64)> = None;
        for candidate in reorder_candidates(current, pinned, &stats) {
            if promotes_any(current, &candidate, &bottlenecks) {
                continue;
            }
            let modelled = model_chain(&candidate, &stats);
            let target = weights.leading_gain(&modelled, &modelled_now);
            let gain = modelled.improvement_over(&modelled_now, target);
            if gain <= 0.0 || collateral_regression(&modelled, &modelled_now, target, config) {
                continue;
            }
            let score = weights.score(&modelled, &modelled_now);
            if best.as_ref().map_or(true, |(s, ..)| score > *s) {
                best = Some((
                    score,
                    RuleDelta {
                        provider_chain: Some(candidate),
                        urgency_thresholds: None,
                    },
                    target,
                    gain,
                ));
            }
        }

        // Order never changes modelled success; timeouts are the lever
        if best.is_none() && weights.dominant() == TargetMetric::SuccessRate {
            if let Some((delta, gain)) =
                widen_thresholds(&active.rule.urgency_thresholds, &class_stats, config)
            {
                best = Some((gain, delta, TargetMetric::SuccessRate, gain));
            }
        }

        let Some((_, delta, target_metric, gain)) = best else {
            return Ok(None);
        };
        if gain < config.min_improvement {
            return Ok(None);
        }

        Ok(Some(OptimizationRecommendation {
            id: Uuid::new_v4(),
            task_class,
            strategy: config.strategy,
            target_metric,
            proposed_rule_delta: delta,
            expected_improvement_pct: gain * 100.0,
            baseline,
            base_version: active.version,
            applied_version: None,
            status: RecommendationStatus::Proposed,
            created_at: Utc::now(),
            applied_at: None,
            evaluated_at: None,
            rolled_back_at: None,
            observed: None,
            note: None,
            applied_at_ms: 0,
            settled_at_ms: 0,
        }))
    }

    /// Reason the recommendation may not be applied, if any
    fn safety_check(
        &self,
        rec: &OptimizationRecommendation,
        config: &OptimizerConfig,
    ) -> Result<(), String> {
        let active = self.state.rules.active(rec.task_class);
        if active.version != rec.base_version {
            return Err(format!(
                "rule moved from version {} to {}",
                rec.base_version, active.version
            ));
        }
        let current = &active.rule.ordered_provider_chain;

        if let Some(chain) = &rec.proposed_rule_delta.provider_chain {
            let mut before = current.clone();
            let mut after = chain.clone();
            before.sort();
            after.sort();
            if before != after {
                return Err("delta adds or drops providers".into());
            }
            if self.state.policy.is_pinned(rec.task_class) && chain.first() != current.first() {
                return Err("delta moves the pinned specialist".into());
            }
        }

        if let Some(thresholds) = &rec.proposed_rule_delta.urgency_thresholds {
            for tier in UrgencyTier::ALL {
                let ms = thresholds.get(tier);
                if ms < config.min_threshold_ms || ms > config.max_threshold_ms {
                    return Err(format!("{tier} threshold {ms}ms out of bounds"));
                }
            }
        }

        rec.proposed_rule_delta
            .apply_to(&active.rule)
            .validate()
            .map_err(|e| e.to_string())
    }

    fn apply(&self, mut rec: OptimizationRecommendation, now_ms: u64, cycle: &mut OptimizationCycle) {
        let active = self.state.rules.active(rec.task_class);
        let rule = rec.proposed_rule_delta.apply_to(&active.rule);
        let reason = format!(
            "{} optimization, expected {:.1}% {} improvement",
            rec.strategy, rec.expected_improvement_pct, rec.target_metric
        );

        match self
            .state
            .rules
            .compare_and_swap(rec.base_version, rule, RuleAuthor::Optimizer, reason)
        {
            Ok(version) => {
                rec.status = RecommendationStatus::Applied;
                rec.applied_version = Some(version.version);
                rec.applied_at = Some(Utc::now());
                rec.applied_at_ms = now_ms;

                tracing::info!(
                    task_class = %rec.task_class,
                    recommendation = %rec.id,
                    version = version.version,
                    target = %rec.target_metric,
                    expected_pct = rec.expected_improvement_pct,
                    "Optimizer recommendation applied"
                );
                self.audit(AuditEventType::OptimizerRecommendation, &rec);
                cycle.applied.push(rec.id);
                self.ledger.lock().push(rec);
            }
            Err(err) => self.reject(rec, err.to_string(), cycle),
        }
    }

    fn reject(&self, mut rec: OptimizationRecommendation, reason: String, cycle: &mut OptimizationCycle) {
        tracing::debug!(
            task_class = %rec.task_class,
            recommendation = %rec.id,
            reason = %reason,
            "Optimizer recommendation rejected"
        );
        rec.status = RecommendationStatus::Rejected;
        rec.note = Some(reason);
        self.audit(AuditEventType::OptimizerSkipped, &rec);
        cycle.rejected.push(rec.id);
        self.ledger.lock().push(rec);
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    /// Judge applied recommendations whose observation window has passed
    pub fn evaluate_pending(&self, config: &OptimizerConfig, cycle: &mut OptimizationCycle) {
        let now = self.state.telemetry.now_ms();
        let window_ms = config.observation_window.as_millis() as u64;

        let due: Vec<OptimizationRecommendation> = self
            .ledger
            .lock()
            .history
            .iter()
            .filter(|r| {
                r.status == RecommendationStatus::Applied
                    && now.saturating_sub(r.applied_at_ms) >= window_ms
            })
            .cloned()
            .collect();

        for rec in due {
            let stats = self.state.telemetry.class_stats(rec.task_class, rec.applied_at_ms);
            let observed = MetricSnapshot::from_class(&stats);

            if observed.requests == 0 {
                if now.saturating_sub(rec.applied_at_ms) < window_ms.saturating_mul(MAX_IDLE_WINDOWS) {
                    continue;
                }
                self.settle(rec.id, RecommendationStatus::Confirmed, observed, Some("no traffic observed".into()));
                cycle.confirmed.push(rec.id);
                continue;
            }

            match find_regression(&rec, &observed, config) {
                Some(regression) => {
                    if self.roll_back(&rec, &regression) {
                        self.settle(rec.id, RecommendationStatus::RolledBack, observed, Some(regression.to_string()));
                        cycle.rolled_back.push(rec.id);
                    } else {
                        self.settle(
                            rec.id,
                            RecommendationStatus::Rejected,
                            observed,
                            Some(format!("{regression}; rule superseded, nothing to revert")),
                        );
                        cycle.rejected.push(rec.id);
                    }
                }
                None => {
                    tracing::info!(
                        task_class = %rec.task_class,
                        recommendation = %rec.id,
                        "Optimizer change confirmed"
                    );
                    self.settle(rec.id, RecommendationStatus::Confirmed, observed, None);
                    cycle.confirmed.push(rec.id);
                }
            }
        }
    }

    /// Restore the version the recommendation replaced
    fn roll_back(&self, rec: &OptimizationRecommendation, regression: &RoutingError) -> bool {
        let Some(applied) = rec.applied_version else {
            return false;
        };
        match self
            .state
            .rules
            .rollback(rec.task_class, Some(applied), regression.to_string())
        {
            Ok(restored) => {
                tracing::warn!(
                    task_class = %rec.task_class,
                    recommendation = %rec.id,
                    restored = restored.version,
                    error = %regression,
                    "Optimizer change rolled back"
                );
                true
            }
            Err(RuleError::VersionConflict { actual, .. }) => {
                tracing::warn!(
                    task_class = %rec.task_class,
                    recommendation = %rec.id,
                    active = actual,
                    error = %regression,
                    "Regressed optimizer change already superseded"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    task_class = %rec.task_class,
                    recommendation = %rec.id,
                    error = %err,
                    "Optimizer rollback failed"
                );
                false
            }
        }
    }

    fn settle(
        &self,
        id: Uuid,
        status: RecommendationStatus,
        observed: MetricSnapshot,
        note: Option<String>,
    ) {
        let settled = {
            let mut ledger = self.ledger.lock();
            let Some(rec) = ledger.history.iter_mut().find(|r| r.id == id) else {
                return;
            };
            let now = Utc::now();
            rec.status = status;
            rec.settled_at_ms = self.state.telemetry.now_ms();
            rec.observed = Some(observed);
            rec.evaluated_at = Some(now);
            if status == RecommendationStatus::RolledBack {
                rec.rolled_back_at = Some(now);
            }
            if note.is_some() {
                rec.note = note;
            }
            rec.clone()
        };

        let event = match status {
            RecommendationStatus::Confirmed => AuditEventType::OptimizerConfirmed,
            RecommendationStatus::RolledBack => AuditEventType::RuleRolledBack,
            _ => AuditEventType::OptimizerSkipped,
        };
        // Rollbacks are announced by the rule store itself
        if event != AuditEventType::RuleRolledBack {
            self.audit(event, &settled);
        }
    }

    fn audit(&self, event_type: AuditEventType, rec: &OptimizationRecommendation) {
        let payload = serde_json::to_value(rec).unwrap_or_else(|_| {
            serde_json::json!({ "id": rec.id, "taskClass": rec.task_class })
        });
        self.state.audit.emit(AuditEvent::new(event_type, payload));
    }
}

impl fmt::Debug for RoutingOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingOptimizer")
            .field("config", &*self.config.read())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Search Helpers
// ============================================================================

/// Candidate orders: every single move plus per-metric sorts
fn reorder_candidates(
    chain: &[String],
    pinned: bool,
    stats: &HashMap<String, ProviderStats>,
) -> Vec<Vec<String>> {
    let start = usize::from(pinned);
    if chain.len() < start + 2 {
        return Vec::new();
    }

    let mut out: Vec<Vec<String>> = Vec::new();
    let mut push = |candidate: Vec<String>| {
        if candidate != chain && !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    for from in start..chain.len() {
        for to in start..chain.len() {
            if from != to {
                let mut candidate = chain.to_vec();
                let moved = candidate.remove(from);
                candidate.insert(to, moved);
                push(candidate);
            }
        }
    }

    let stat = |p: &String| stats.get(p).cloned().unwrap_or_default();
    let sorted_by = |key: &dyn Fn(&ProviderStats) -> f64| {
        let mut head = chain[..start].to_vec();
        let mut tail = chain[start..].to_vec();
        tail.sort_by(|a, b| {
            key(&stat(a))
                .partial_cmp(&key(&stat(b)))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        head.extend(tail);
        head
    };

    push(sorted_by(&|s| -s.success_rate));
    // Classic ordering for expected sequential latency
    push(sorted_by(&|s| s.mean_latency_ms / s.success_rate.max(f64::EPSILON)));
    push(sorted_by(&|s| s.cost_per_request / s.success_rate.max(f64::EPSILON)));
    out
}

/// Whether any flagged provider moves earlier
fn promotes_any(current: &[String], candidate: &[String], flagged: &[String]) -> bool {
    flagged.iter().any(|provider| {
        let before = current.iter().position(|p| p == provider);
        let after = candidate.iter().position(|p| p == provider);
        matches!((before, after), (Some(b), Some(a)) if a < b)
    })
}

/// Whether a modelled change costs too much on the metrics it does not target
fn collateral_regression(
    modelled: &MetricSnapshot,
    base: &MetricSnapshot,
    target: TargetMetric,
    config: &OptimizerConfig,
) -> bool {
    TargetMetric::ALL
        .iter()
        .filter(|m| **m != target)
        .any(|m| modelled.improvement_over(base, *m) < -config.collateral_tolerance)
}

/// Widen every threshold when timeouts eat into success rate
fn widen_thresholds(
    current: &UrgencyThresholds,
    class_stats: &ClassStats,
    config: &OptimizerConfig,
) -> Option<(RuleDelta, f64)> {
    if class_stats.requests == 0 || class_stats.timeout_rate < 0.05 {
        return None;
    }
    let mut widened = *current;
    let mut changed = false;
    for tier in UrgencyTier::ALL {
        let ms = current.get(tier);
        let next = (ms + ms / 4).min(config.max_threshold_ms);
        if next > ms {
            widened.set(tier, next);
            changed = true;
        }
    }
    if !changed {
        return None;
    }
    // Assume half of the timed-out requests complete under the wider budget
    let base = class_stats.success_rate.max(f64::EPSILON);
    let gain = (class_stats.timeout_rate * 0.5) / base;
    Some((
        RuleDelta {
            provider_chain: None,
            urgency_thresholds: Some(widened),
        },
        gain,
    ))
}

/// Regression of an applied change, if any
fn find_regression(
    rec: &OptimizationRecommendation,
    observed: &MetricSnapshot,
    config: &OptimizerConfig,
) -> Option<RoutingError> {
    for metric in TargetMetric::ALL {
        let change = observed.improvement_over(&rec.baseline, metric);
        let tolerance = if metric == rec.target_metric {
            config.regression_tolerance
        } else {
            config.collateral_tolerance
        };
        if change < -tolerance {
            return Some(RoutingError::RegressionDetected {
                task_class: rec.task_class,
                metric: metric.to_string(),
                regression_pct: -change * 100.0,
            });
        }
    }
    None
}
