//! Latency Telemetry Engine
//!
//! Rolling latency windows per `(provider, operation class)`, SLO burn
//! rates per operation class, and per-task-class request windows used by
//! the health monitor and the optimizer.
//!
//! # Percentiles
//!
//! Each window keeps its samples twice: in arrival order (for age and
//! count eviction) and in an ordered multiset keyed by latency. Insertion
//! and eviction are `O(log n)`. P95/P99 are exact nearest-rank order
//! statistics of the retained samples (declared tolerance: zero).
//!
//! # Burn rate
//!
//! ```text
//! burn = bad_event_rate / (1 - slo_target)
//! bad  = failure | timeout | latency > objective(operation_class)
//! ```
//!
//! A burn of 1.0 spends the error budget exactly over the SLO period.
//! `>= 14.4` over the short horizon is critical, `>= 6.0` over the long
//! horizon is a warning.
//!
//! Health-probe latencies are kept in a separate synthetic counter and
//! never enter real-traffic windows.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::request::{Request, RoutePath};
use crate::routing::classifier::TaskClass;

// ============================================================================
// Operation Class
// ============================================================================

/// Latency class of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Answer likely served from a provider-side cache
    Cached,
    /// Lookup or tool-assisted retrieval
    Retrieval,
    /// Full generation
    Generation,
    /// Health probes (never mixed into real traffic)
    Synthetic,
}

impl OperationClass {
    /// Classes that carry real traffic
    pub const REAL: [OperationClass; 3] = [Self::Cached, Self::Retrieval, Self::Generation];

    /// Classification under the default heuristics
    #[must_use]
    pub fn for_request(request: &Request) -> Self {
        OperationHeuristics::default().classify(request)
    }

    fn index(self) -> usize {
        match self {
            Self::Cached => 0,
            Self::Retrieval => 1,
            Self::Generation | Self::Synthetic => 2,
        }
    }
}

/// Intents that name a lookup
const RETRIEVAL_INTENTS: [&str; 5] = ["retriev", "search", "query", "fetch", "lookup"];

/// Intents whose answers are usually cacheable
const CACHED_INTENTS: [&str; 3] = ["cached", "cache", "faq"];

/// Request-shape rules for picking an operation class
///
/// 1. Tools requested, a prompt that references retrieval or knowledge
///    context, or a lookup intent -> `Retrieval`
/// 2. A short prompt -> `Cached`; a cacheable intent doubles the limit
/// 3. Everything else -> `Generation`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationHeuristics {
    /// Longest prompt, in characters, still treated as cached
    pub short_prompt_chars: usize,
    /// Lowercase prompt fragments that signal retrieval
    pub retrieval_markers: Vec<String>,
}

impl Default for OperationHeuristics {
    fn default() -> Self {
        Self {
            short_prompt_chars: 200,
            retrieval_markers: [
                "knowledge",
                "retriev",
                "search",
                "look up",
                "documents",
                "according to",
                "sources",
                "context:",
            ]
            .iter()
            .map(|m| (*m).to_string())
            .collect(),
        }
    }
}

impl OperationHeuristics {
    /// Operation class of a request
    #[must_use]
    pub fn classify(&self, request: &Request) -> OperationClass {
        let intent = request.intent.to_ascii_lowercase();
        let prompt = request.prompt.to_lowercase();

        let references_knowledge = self
            .retrieval_markers
            .iter()
            .any(|marker| prompt.contains(marker.as_str()));
        if !request.tools_requested.is_empty()
            || references_knowledge
            || RETRIEVAL_INTENTS.iter().any(|k| intent.contains(k))
        {
            return OperationClass::Retrieval;
        }

        let mut limit = self.short_prompt_chars;
        if CACHED_INTENTS.iter().any(|k| intent.contains(k)) {
            limit = limit.saturating_mul(2);
        }
        if request.prompt.chars().count() <= limit {
            OperationClass::Cached
        } else {
            OperationClass::Generation
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => f.write_str("cached"),
            Self::Retrieval => f.write_str("retrieval"),
            Self::Generation => f.write_str("generation"),
            Self::Synthetic => f.write_str("synthetic"),
        }
    }
}

// ============================================================================
// Samples
// ============================================================================

/// What a single provider attempt ended with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOutcome {
    /// Provider answered
    Success,
    /// Provider returned an error
    Failure,
    /// Attempt hit its deadline
    Timeout,
    /// Caller went away before the provider answered
    Cancelled,
}

impl SampleOutcome {
    fn is_bad(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

/// One observed provider attempt
#[derive(Clone, Debug, PartialEq)]
pub struct LatencySample {
    /// Provider ID
    pub provider: String,
    /// Operation class
    pub operation_class: OperationClass,
    /// Clock time of completion
    pub timestamp_ms: u64,
    /// Observed latency
    pub latency_ms: u64,
    /// Outcome
    pub outcome: SampleOutcome,
    /// Cost of the attempt, when known
    pub cost_usd: Option<f64>,
}

#[derive(Clone, Copy, Debug)]
struct WindowSample {
    timestamp_ms: u64,
    latency_ms: u64,
    outcome: SampleOutcome,
    cost_usd: Option<f64>,
}

/// One completed request, attributed to its task class
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestRecord {
    /// Clock time of completion
    pub timestamp_ms: u64,
    /// End-to-end latency including fallbacks
    pub latency_ms: u64,
    /// Whether some provider served it
    pub success: bool,
    /// Whether any attempt timed out
    pub timed_out: bool,
    /// Whether the first candidate served it
    pub served_by_primary: bool,
    /// Total cost
    pub cost_usd: f64,
}

// ============================================================================
// Configuration
// ============================================================================

/// SLO objectives and burn-rate thresholds
#[derive(Clone, Debug, PartialEq)]
pub struct SloConfig {
    /// Latency objective for cached operations
    pub cached_objective: Duration,
    /// Latency objective for retrieval operations
    pub retrieval_objective: Duration,
    /// Latency objective for generation operations
    pub generation_objective: Duration,
    /// Fraction of good events the SLO promises
    pub target: f64,
    /// Fast-burn horizon
    pub short_horizon: Duration,
    /// Slow-burn horizon
    pub long_horizon: Duration,
    /// Short-horizon burn rate considered critical
    pub critical_burn_rate: f64,
    /// Long-horizon burn rate considered a warning
    pub warning_burn_rate: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            cached_objective: Duration::from_secs(2),
            retrieval_objective: Duration::from_secs(8),
            generation_objective: Duration::from_secs(15),
            target: 0.99,
            short_horizon: Duration::from_secs(5 * 60),
            long_horizon: Duration::from_secs(60 * 60),
            critical_burn_rate: 14.4,
            warning_burn_rate: 6.0,
        }
    }
}

impl SloConfig {
    /// Latency objective of an operation class
    #[must_use]
    pub fn objective(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Cached => self.cached_objective,
            OperationClass::Retrieval => self.retrieval_objective,
            OperationClass::Generation | OperationClass::Synthetic => self.generation_objective,
        }
    }
}

/// Telemetry retention
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryConfig {
    /// Maximum samples per window
    pub max_samples: usize,
    /// Maximum sample age
    pub max_age: Duration,
    /// SLO settings
    pub slo: SloConfig,
    /// Request-shape rules for operation classes
    pub operations: OperationHeuristics,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            max_samples: 10_000,
            max_age: Duration::from_secs(2 * 60 * 60),
            slo: SloConfig::default(),
            operations: OperationHeuristics::default(),
        }
    }
}

// ============================================================================
// Percentile Window
// ============================================================================

/// Count- and age-bounded sample window with an ordered latency multiset
#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<WindowSample>,
    /// latency -> multiplicity, cancelled samples excluded
    ranked: BTreeMap<u64, u32>,
    ranked_len: usize,
}

impl SampleWindow {
    fn push(&mut self, sample: WindowSample, max_samples: usize) {
        if sample.outcome != SampleOutcome::Cancelled {
            *self.ranked.entry(sample.latency_ms).or_insert(0) += 1;
            self.ranked_len += 1;
        }
        self.samples.push_back(sample);

        while self.samples.len() > max_samples.max(1) {
            self.pop_front();
        }
    }

    fn evict_older_than(&mut self, cutoff_ms: u64) {
        while self
            .samples
            .front()
            .is_some_and(|s| s.timestamp_ms < cutoff_ms)
        {
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        let Some(old) = self.samples.pop_front() else {
            return;
        };
        if old.outcome == SampleOutcome::Cancelled {
            return;
        }
        if let Some(count) = self.ranked.get_mut(&old.latency_ms) {
            *count -= 1;
            if *count == 0 {
                self.ranked.remove(&old.latency_ms);
            }
            self.ranked_len -= 1;
        }
    }

    /// Nearest-rank percentile of retained, non-cancelled samples
    fn percentile(&self, p: f64) -> Option<u64> {
        let n = self.ranked_len;
        if n == 0 {
            return None;
        }
        let rank = nearest_rank(p, n);

        // High percentiles sit near the top; walk from there
        let from_top = n - rank + 1;
        let mut seen = 0usize;
        for (latency, count) in self.ranked.iter().rev() {
            seen += *count as usize;
            if seen >= from_top {
                return Some(*latency);
            }
        }
        None
    }

    fn since(&self, since_ms: u64) -> impl Iterator<Item = &WindowSample> {
        self.samples
            .iter()
            .filter(move |s| s.timestamp_ms >= since_ms)
    }
}

/// 1-based nearest rank for percentile `p` of `n` samples
fn nearest_rank(p: f64, n: usize) -> usize {
    let p = p.clamp(0.0, 100.0);
    let rank = (p * n as f64 / 100.0 - 1e-9).ceil() as usize;
    rank.clamp(1, n)
}

/// Nearest-rank percentile of an already sorted slice
fn percentile_of_sorted(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    Some(sorted[nearest_rank(p, sorted.len()) - 1])
}

// ============================================================================
// Aggregates
// ============================================================================

/// SLO health of an operation class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SloStatus {
    /// Within budget
    Ok,
    /// Slow burn over the long horizon
    Warning,
    /// Fast burn over the short horizon
    Critical,
}

impl fmt::Display for SloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Warning => f.write_str("warning"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// Aggregate real-traffic performance of one provider
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    /// Provider ID
    pub provider: String,
    /// Non-cancelled samples considered
    pub samples: usize,
    /// Mean latency
    pub mean_latency_ms: f64,
    /// P95 latency
    pub p95_ms: u64,
    /// P99 latency
    pub p99_ms: u64,
    /// Fraction of successful attempts
    pub success_rate: f64,
    /// Fraction of attempts that timed out
    pub timeout_rate: f64,
    /// Mean cost of successful attempts
    pub cost_per_request: f64,
}

/// Aggregate performance of one task class
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    /// Task class
    pub task_class: Option<TaskClass>,
    /// Completed requests considered
    pub requests: usize,
    /// Fraction served
    pub success_rate: f64,
    /// Mean end-to-end latency
    pub mean_latency_ms: f64,
    /// P95 end-to-end latency
    pub p95_latency_ms: u64,
    /// Fraction with at least one timed-out attempt
    pub timeout_rate: f64,
    /// Fraction served by the first candidate
    pub primary_hit_rate: f64,
    /// Mean cost per request
    pub cost_per_request: f64,
}

/// Health-probe counters for one provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticStats {
    /// Probes issued
    pub probes: u64,
    /// Probes that failed or timed out
    pub failures: u64,
    /// Sum of probe latencies
    pub total_latency_ms: u64,
    /// Latency of the most recent direct probe
    pub last_direct_ms: Option<u64>,
    /// Latency of the most recent brokered probe
    pub last_brokered_ms: Option<u64>,
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Default)]
struct ProviderWindows {
    classes: [Mutex<SampleWindow>; 3],
    synthetic: Mutex<SyntheticStats>,
}

/// Latency telemetry for all providers and task classes
pub struct LatencyTelemetry {
    config: RwLock<TelemetryConfig>,
    clock: Arc<dyn Clock>,
    providers: DashMap<String, Arc<ProviderWindows>>,
    task_classes: DashMap<TaskClass, Arc<Mutex<VecDeque<RequestRecord>>>>,
    cancelled: AtomicU64,
}

impl LatencyTelemetry {
    /// Create an engine
    pub fn new(config: TelemetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            providers: DashMap::new(),
            task_classes: DashMap::new(),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Current configuration
    pub fn config(&self) -> TelemetryConfig {
        self.config.read().clone()
    }

    /// Replace SLO settings
    pub fn set_slo(&self, slo: SloConfig) {
        self.config.write().slo = slo;
    }

    /// Replace the operation-class heuristics
    pub fn set_operation_heuristics(&self, operations: OperationHeuristics) {
        self.config.write().operations = operations;
    }

    /// Operation class of a request under the configured heuristics
    pub fn operation_class(&self, request: &Request) -> OperationClass {
        self.config.read().operations.classify(request)
    }

    /// Clock time now
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Record a real-traffic attempt
    ///
    /// Synthetic samples passed here are routed to the probe counters.
    pub fn record(&self, sample: LatencySample) {
        if sample.operation_class == OperationClass::Synthetic {
            self.record_synthetic(
                &sample.provider,
                RoutePath::Brokered,
                sample.latency_ms,
                sample.outcome == SampleOutcome::Success,
            );
            return;
        }
        if sample.outcome == SampleOutcome::Cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        let (max_samples, cutoff) = self.retention(sample.timestamp_ms);
        let windows = self.windows(&sample.provider);
        let mut window = windows.classes[sample.operation_class.index()].lock();
        window.push(
            WindowSample {
                timestamp_ms: sample.timestamp_ms,
                latency_ms: sample.latency_ms,
                outcome: sample.outcome,
                cost_usd: sample.cost_usd,
            },
            max_samples,
        );
        window.evict_older_than(cutoff);
    }

    /// Record a health-probe result
    pub fn record_synthetic(&self, provider: &str, path: RoutePath, latency_ms: u64, ok: bool) {
        let windows = self.windows(provider);
        let mut stats = windows.synthetic.lock();
        stats.probes += 1;
        if !ok {
            stats.failures += 1;
        }
        stats.total_latency_ms = stats.total_latency_ms.saturating_add(latency_ms);
        match path {
            RoutePath::Direct => stats.last_direct_ms = Some(latency_ms),
            RoutePath::Brokered => stats.last_brokered_ms = Some(latency_ms),
        }
    }

    /// Record a completed request against its task class
    pub fn record_request(&self, task_class: TaskClass, record: RequestRecord) {
        let (max_samples, cutoff) = self.retention(record.timestamp_ms);
        let window = self
            .task_classes
            .entry(task_class)
            .or_default()
            .clone();

        let mut window = window.lock();
        window.push_back(record);
        while window.len() > max_samples.max(1)
            || window.front().is_some_and(|r| r.timestamp_ms < cutoff)
        {
            window.pop_front();
        }
    }

    /// Exact nearest-rank percentile for one `(provider, operation class)`
    pub fn percentile(&self, provider: &str, class: OperationClass, p: f64) -> Option<u64> {
        if class == OperationClass::Synthetic {
            return None;
        }
        let windows = self.providers.get(provider).map(|w| w.clone())?;
        let (_, cutoff) = self.retention(self.clock.now_ms());
        let mut window = windows.classes[class.index()].lock();
        window.evict_older_than(cutoff);
        window.percentile(p)
    }

    /// Burn rate of an operation class over a horizon, across providers
    pub fn burn_rate(&self, class: OperationClass, horizon: Duration) -> f64 {
        if class == OperationClass::Synthetic {
            return 0.0;
        }
        let slo = self.config.read().slo.clone();
        let objective_ms = slo.objective(class).as_millis() as u64;
        let since = self
            .clock
            .now_ms()
            .saturating_sub(horizon.as_millis() as u64);

        let mut total = 0u64;
        let mut bad = 0u64;
        for windows in self.all_windows() {
            let window = windows.classes[class.index()].lock();
            for sample in window.since(since) {
                if sample.outcome == SampleOutcome::Cancelled {
                    continue;
                }
                total += 1;
                if sample.outcome.is_bad() || sample.latency_ms > objective_ms {
                    bad += 1;
                }
            }
        }

        if total == 0 {
            return 0.0;
        }
        let budget = (1.0 - slo.target).max(f64::EPSILON);
        (bad as f64 / total as f64) / budget
    }

    /// Short- and long-horizon burn rates
    pub fn burn_rates(&self, class: OperationClass) -> (f64, f64) {
        let slo = self.config.read().slo.clone();
        (
            self.burn_rate(class, slo.short_horizon),
            self.burn_rate(class, slo.long_horizon),
        )
    }

    /// SLO status of an operation class
    pub fn slo_status(&self, class: OperationClass) -> SloStatus {
        let slo = self.config.read().slo.clone();
        let (short, long) = self.burn_rates(class);

        if short >= slo.critical_burn_rate {
            SloStatus::Critical
        } else if long >= slo.warning_burn_rate {
            SloStatus::Warning
        } else {
            SloStatus::Ok
        }
    }

    /// Aggregate performance of a provider since `since_ms`
    pub fn provider_stats(&self, provider: &str, since_ms: u64) -> ProviderStats {
        let mut stats = ProviderStats {
            provider: provider.to_string(),
            ..ProviderStats::default()
        };
        let Some(windows) = self.providers.get(provider).map(|w| w.clone()) else {
            return stats;
        };

        let mut latencies = Vec::new();
        let mut successes = 0usize;
        let mut timeouts = 0usize;
        let mut cost_total = 0.0;
        let mut cost_samples = 0usize;

        for class in OperationClass::REAL {
            let window = windows.classes[class.index()].lock();
            for sample in window.since(since_ms) {
                if sample.outcome == SampleOutcome::Cancelled {
                    continue;
                }
                latencies.push(sample.latency_ms);
                match sample.outcome {
                    SampleOutcome::Success => {
                        successes += 1;
                        if let Some(cost) = sample.cost_usd {
                            cost_total += cost;
                            cost_samples += 1;
                        }
                    }
                    SampleOutcome::Timeout => timeouts += 1,
                    _ => {}
                }
            }
        }

        if latencies.is_empty() {
            return stats;
        }
        latencies.sort_unstable();

        let n = latencies.len();
        stats.samples = n;
        stats.mean_latency_ms = latencies.iter().sum::<u64>() as f64 / n as f64;
        stats.p95_ms = percentile_of_sorted(&latencies, 95.0).unwrap_or(0);
        stats.p99_ms = percentile_of_sorted(&latencies, 99.0).unwrap_or(0);
        stats.success_rate = successes as f64 / n as f64;
        stats.timeout_rate = timeouts as f64 / n as f64;
        if cost_samples > 0 {
            stats.cost_per_request = cost_total / cost_samples as f64;
        }
        stats
    }

    /// Non-cancelled real-traffic samples of a provider since `since_ms`
    pub fn sample_count(&self, provider: &str, since_ms: u64) -> usize {
        self.sample_counts(provider, since_ms)
            .iter()
            .map(|(_, n)| n)
            .sum()
    }

    /// Non-cancelled samples per real operation class since `since_ms`
    pub fn sample_counts(&self, provider: &str, since_ms: u64) -> [(OperationClass, usize); 3] {
        let windows = self.providers.get(provider).map(|w| w.clone());
        OperationClass::REAL.map(|class| {
            let count = windows.as_ref().map_or(0, |windows| {
                windows.classes[class.index()]
                    .lock()
                    .since(since_ms)
                    .filter(|s| s.outcome != SampleOutcome::Cancelled)
                    .count()
            });
            (class, count)
        })
    }

    /// Aggregate performance of a task class since `since_ms`
    pub fn class_stats(&self, task_class: TaskClass, since_ms: u64) -> ClassStats {
        let mut stats = ClassStats {
            task_class: Some(task_class),
            ..ClassStats::default()
        };
        let Some(window) = self.task_classes.get(&task_class).map(|w| w.clone()) else {
            return stats;
        };

        let window = window.lock();
        let records: Vec<&RequestRecord> = window
            .iter()
            .filter(|r| r.timestamp_ms >= since_ms)
            .collect();
        if records.is_empty() {
            return stats;
        }

        let n = records.len() as f64;
        let mut latencies: Vec<u64> = records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();

        stats.requests = records.len();
        stats.success_rate = records.iter().filter(|r| r.success).count() as f64 / n;
        stats.timeout_rate = records.iter().filter(|r| r.timed_out).count() as f64 / n;
        stats.primary_hit_rate =
            records.iter().filter(|r| r.served_by_primary).count() as f64 / n;
        stats.mean_latency_ms = latencies.iter().sum::<u64>() as f64 / n;
        stats.p95_latency_ms = percentile_of_sorted(&latencies, 95.0).unwrap_or(0);
        stats.cost_per_request = records.iter().map(|r| r.cost_usd).sum::<f64>() / n;
        stats
    }

    /// Probe counters of a provider
    pub fn synthetic_stats(&self, provider: &str) -> Option<SyntheticStats> {
        self.providers
            .get(provider)
            .map(|w| w.synthetic.lock().clone())
    }

    /// Attempts recorded as cancelled
    pub fn cancelled_attempts(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Providers with any recorded telemetry, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn retention(&self, now_ms: u64) -> (usize, u64) {
        let config = self.config.read();
        (
            config.max_samples,
            now_ms.saturating_sub(config.max_age.as_millis() as u64),
        )
    }

    fn windows(&self, provider: &str) -> Arc<ProviderWindows> {
        if let Some(w) = self.providers.get(provider) {
            return w.clone();
        }
        self.providers
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    fn all_windows(&self) -> Vec<Arc<ProviderWindows>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }
}

impl fmt::Debug for LatencyTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatencyTelemetry")
            .field("providers", &self.providers.len())
            .field("cancelled", &self.cancelled_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::request::ToolSpec;

    fn engine() -> (LatencyTelemetry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        (
            LatencyTelemetry::new(TelemetryConfig::default(), clock.clone()),
            clock,
        )
    }

    fn sample(provider: &str, ts: u64, latency: u64, outcome: SampleOutcome) -> LatencySample {
        LatencySample {
            provider: provider.to_string(),
            operation_class: OperationClass::Generation,
            timestamp_ms: ts,
            latency_ms: latency,
            outcome,
            cost_usd: Some(0.01),
        }
    }

    #[test]
    fn test_operation_class_heuristic() {
        let long_prompt = "Draft a detailed seasonal menu. ".repeat(20);

        let short_chat = Request::new("hi").with_intent("analysis");
        let with_tool = Request::new("hi").with_intent("analysis").with_tool(ToolSpec::new("search"));
        let knowledge = Request::new(format!("Using the knowledge base, {long_prompt}"))
            .with_intent("analysis");
        let lookup_intent = Request::new(long_prompt.clone()).with_intent("lookup");
        let long_faq = Request::new("why? ".repeat(1_000)).with_intent("faq");
        let generation = Request::new(long_prompt).with_intent("analysis");

        assert_eq!(OperationClass::for_request(&short_chat), OperationClass::Cached);
        assert_eq!(OperationClass::for_request(&with_tool), OperationClass::Retrieval);
        assert_eq!(OperationClass::for_request(&knowledge), OperationClass::Retrieval);
        assert_eq!(OperationClass::for_request(&lookup_intent), OperationClass::Retrieval);
        assert_eq!(OperationClass::for_request(&long_faq), OperationClass::Generation);
        assert_eq!(OperationClass::for_request(&generation), OperationClass::Generation);
    }

    #[test]
    fn test_cacheable_intent_extends_short_limit() {
        let heuristics = OperationHeuristics {
            short_prompt_chars: 10,
            retrieval_markers: Vec::new(),
        };
        let prompt = "x".repeat(15);
        let faq = Request::new(prompt.clone()).with_intent("faq");
        let chat = Request::new(prompt).with_intent("analysis");

        assert_eq!(heuristics.classify(&faq), OperationClass::Cached);
        assert_eq!(heuristics.classify(&chat), OperationClass::Generation);
    }

    #[test]
    fn test_configured_heuristics_drive_classification() {
        let (engine, _) = engine();
        let request = Request::new("hello").with_intent("analysis");
        assert_eq!(engine.operation_class(&request), OperationClass::Cached);

        engine.set_operation_heuristics(OperationHeuristics {
            short_prompt_chars: 0,
            retrieval_markers: vec!["hello".into()],
        });
        assert_eq!(engine.operation_class(&request), OperationClass::Retrieval);
    }

    #[test]
    fn test_p95_matches_order_statistic() {
        let (engine, clock) = engine();
        let now = clock.now_ms();

        // 1..=200 shuffled deterministically
        for i in 0..200u64 {
            let latency = (i * 73) % 200 + 1;
            engine.record(sample("atlas", now, latency, SampleOutcome::Success));
        }

        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 95.0), Some(190));
        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 99.0), Some(198));
        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 50.0), Some(100));
        assert_eq!(engine.percentile("atlas", OperationClass::Cached, 95.0), None);
    }

    #[test]
    fn test_percentile_with_duplicates() {
        let mut window = SampleWindow::default();
        for latency in [5, 5, 5, 5, 5, 5, 5, 5, 5, 100] {
            window.push(
                WindowSample {
                    timestamp_ms: 1,
                    latency_ms: latency,
                    outcome: SampleOutcome::Success,
                    cost_usd: None,
                },
                100,
            );
        }
        assert_eq!(window.percentile(90.0), Some(5));
        assert_eq!(window.percentile(95.0), Some(100));
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = LatencyTelemetry::new(
            TelemetryConfig {
                max_samples: 10,
                ..TelemetryConfig::default()
            },
            clock,
        );

        for latency in 1..=20u64 {
            engine.record(sample("atlas", 1_000, latency, SampleOutcome::Success));
        }

        assert_eq!(engine.sample_count("atlas", 0), 10);
        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 1.0), Some(11));
    }

    #[test]
    fn test_sample_counts_split_by_operation_class() {
        let engine = LatencyTelemetry::new(
            TelemetryConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        );
        for _ in 0..3 {
            engine.record(sample("atlas", 1_000, 10, SampleOutcome::Success));
        }
        engine.record(LatencySample {
            operation_class: OperationClass::Retrieval,
            ..sample("atlas", 1_000, 10, SampleOutcome::Success)
        });
        engine.record(LatencySample {
            operation_class: OperationClass::Cached,
            ..sample("atlas", 1_000, 10, SampleOutcome::Cancelled)
        });

        assert_eq!(
            engine.sample_counts("atlas", 0),
            [
                (OperationClass::Cached, 0),
                (OperationClass::Retrieval, 1),
                (OperationClass::Generation, 3),
            ]
        );
        assert_eq!(engine.sample_count("atlas", 0), 4);
        assert_eq!(engine.sample_counts("nobody", 0)[2], (OperationClass::Generation, 0));
    }

    #[test]
    fn test_age_bound_evicts_old() {
        let (engine, clock) = engine();
        let start = clock.now_ms();
        engine.record(sample("atlas", start, 9_999, SampleOutcome::Success));

        clock.advance(Duration::from_secs(3 * 60 * 60));
        engine.record(sample("atlas", clock.now_ms(), 10, SampleOutcome::Success));

        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 100.0), Some(10));
    }

    #[test]
    fn test_cancelled_counted_separately() {
        let (engine, clock) = engine();
        let now = clock.now_ms();
        engine.record(sample("atlas", now, 100, SampleOutcome::Success));
        engine.record(sample("atlas", now, 50_000, SampleOutcome::Cancelled));

        assert_eq!(engine.cancelled_attempts(), 1);
        assert_eq!(engine.sample_count("atlas", 0), 1);
        assert_eq!(engine.percentile("atlas", OperationClass::Generation, 100.0), Some(100));
    }

    #[test]
    fn test_synthetic_never_pollutes_real_windows() {
        let (engine, clock) = engine();
        engine.record_synthetic("atlas", RoutePath::Direct, 40, true);
        engine.record(LatencySample {
            operation_class: OperationClass::Synthetic,
            ..sample("atlas", clock.now_ms(), 90, SampleOutcome::Failure)
        });

        assert_eq!(engine.sample_count("atlas", 0), 0);
        let synthetic = engine.synthetic_stats("atlas").unwrap();
        assert_eq!(synthetic.probes, 2);
        assert_eq!(synthetic.failures, 1);
        assert_eq!(synthetic.last_direct_ms, Some(40));
    }

    #[test]
    fn test_burn_rate_and_status() {
        let (engine, clock) = engine();
        let now = clock.now_ms();

        // 20% bad: 10 failures, 10 too slow, 80 good
        for _ in 0..10 {
            engine.record(sample("atlas", now, 100, SampleOutcome::Failure));
            engine.record(sample("sage", now, 20_000, SampleOutcome::Success));
        }
        for _ in 0..80 {
            engine.record(sample("atlas", now, 100, SampleOutcome::Success));
        }

        let burn = engine.burn_rate(OperationClass::Generation, Duration::from_secs(300));
        assert!((burn - 20.0).abs() < 1e-6, "burn = {burn}");
        assert_eq!(engine.slo_status(OperationClass::Generation), SloStatus::Critical);
        assert_eq!(engine.slo_status(OperationClass::Cached), SloStatus::Ok);
    }

    #[test]
    fn test_warning_from_long_horizon_only() {
        let (engine, clock) = engine();
        let old = clock.now_ms();
        // 7% bad 30 minutes ago, clean now
        for i in 0..100 {
            let outcome = if i < 7 {
                SampleOutcome::Timeout
            } else {
                SampleOutcome::Success
            };
            engine.record(sample("atlas", old, 100, outcome));
        }
        clock.advance(Duration::from_secs(30 * 60));
        engine.record(sample("atlas", clock.now_ms(), 100, SampleOutcome::Success));

        assert_eq!(engine.slo_status(OperationClass::Generation), SloStatus::Warning);
    }

    #[test]
    fn test_provider_stats() {
        let (engine, clock) = engine();
        let now = clock.now_ms();
        for i in 1..=10u64 {
            let outcome = if i == 10 {
                SampleOutcome::Timeout
            } else {
                SampleOutcome::Success
            };
            engine.record(sample("atlas", now, i * 100, outcome));
        }

        let stats = engine.provider_stats("atlas", 0);
        assert_eq!(stats.samples, 10);
        assert!((stats.mean_latency_ms - 550.0).abs() < 1e-9);
        assert_eq!(stats.p95_ms, 1000);
        assert!((stats.success_rate - 0.9).abs() < 1e-9);
        assert!((stats.timeout_rate - 0.1).abs() < 1e-9);
        assert!((stats.cost_per_request - 0.01).abs() < 1e-9);

        let empty = engine.provider_stats("ghost", 0);
        assert_eq!(empty.samples, 0);
    }

    #[test]
    fn test_class_stats_since() {
        let (engine, clock) = engine();
        let t0 = clock.now_ms();
        engine.record_request(
            TaskClass::EndUser,
            RequestRecord {
                timestamp_ms: t0,
                latency_ms: 100,
                success: true,
                timed_out: false,
                served_by_primary: true,
                cost_usd: 0.02,
            },
        );
        clock.advance(Duration::from_secs(10));
        engine.record_request(
            TaskClass::EndUser,
            RequestRecord {
                timestamp_ms: clock.now_ms(),
                latency_ms: 300,
                success: false,
                timed_out: true,
                served_by_primary: false,
                cost_usd: 0.0,
            },
        );

        let all = engine.class_stats(TaskClass::EndUser, 0);
        assert_eq!(all.requests, 2);
        assert!((all.success_rate - 0.5).abs() < 1e-9);
        assert!((all.primary_hit_rate - 0.5).abs() < 1e-9);

        let recent = engine.class_stats(TaskClass::EndUser, t0 + 1);
        assert_eq!(recent.requests, 1);
        assert_eq!(recent.p95_latency_ms, 300);

        assert_eq!(engine.class_stats(TaskClass::Audience, 0).requests, 0);
    }

    #[test]
    fn test_nearest_rank() {
        assert_eq!(nearest_rank(95.0, 100), 95);
        assert_eq!(nearest_rank(95.0, 20), 19);
        assert_eq!(nearest_rank(0.0, 5), 1);
        assert_eq!(nearest_rank(100.0, 5), 5);
    }
}
