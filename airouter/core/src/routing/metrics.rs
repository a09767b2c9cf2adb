//! Router Metrics
//!
//! Observability for the routing system:
//! - Request, fallback and exhaustion counters
//! - End-to-end latency histogram
//! - Periodic [`MetricsReport`] with per-provider P95/P99, burn rates and
//!   circuit state, pushed to the metrics sink
//! - Prometheus text rendering

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::ProviderRegistry;
use crate::request::RoutePath;
use crate::routing::circuit::{CircuitBreakerRegistry, CircuitState};
use crate::routing::classifier::TaskClass;
use crate::routing::telemetry::{LatencyTelemetry, OperationClass, SloStatus};

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// Fixed-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds
    buckets: Vec<u64>,
    /// Count per bucket (last bucket is +Inf)
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bounds
    pub fn new(buckets: Vec<u64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Buckets sized for the urgency tiers (ms)
    pub fn latency_default() -> Self {
        Self::new(vec![
            50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 15_000, 30_000, 60_000,
        ])
    }

    /// Record a value
    pub fn record(&self, value: u64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len());

        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    /// Snapshot of counts
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total: self.total_count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
}

impl HistogramSnapshot {
    /// Mean of recorded values
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum as f64 / self.total as f64
        }
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Request-path counters
#[derive(Debug)]
pub struct RouterMetrics {
    /// Requests received
    pub requests: Counter,
    /// Requests served by some provider
    pub served: Counter,
    /// Requests served by a non-primary candidate
    pub fallbacks: Counter,
    /// Requests that ended in `AllProvidersExhausted`
    pub exhausted: Counter,
    /// Provider attempts that failed
    pub attempt_failures: Counter,
    /// Attempts that hit their deadline
    pub attempt_timeouts: Counter,
    /// Providers removed by the compliance gate
    pub compliance_skips: Counter,
    /// Candidates skipped because the circuit refused them
    pub circuit_rejections: Counter,
    /// Requests abandoned by their caller
    pub cancellations: Counter,
    /// Requests in flight
    pub in_flight: Gauge,
    /// End-to-end latency
    pub latency: Histogram,
    per_class: [Counter; 3],
    per_path: [Counter; 2],
    started_at: Instant,
}

impl RouterMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            requests: Counter::new(),
            served: Counter::new(),
            fallbacks: Counter::new(),
            exhausted: Counter::new(),
            attempt_failures: Counter::new(),
            attempt_timeouts: Counter::new(),
            compliance_skips: Counter::new(),
            circuit_rejections: Counter::new(),
            cancellations: Counter::new(),
            in_flight: Gauge::new(),
            latency: Histogram::latency_default(),
            per_class: Default::default(),
            per_path: Default::default(),
            started_at: Instant::now(),
        }
    }

    /// Count a classified request
    pub fn record_class(&self, class: TaskClass) {
        self.per_class[class_index(class)].inc();
    }

    /// Count a served request by path
    pub fn record_path(&self, path: RoutePath) {
        self.per_path[path_index(path)].inc();
    }

    /// Requests seen for a task class
    pub fn class_count(&self, class: TaskClass) -> u64 {
        self.per_class[class_index(class)].get()
    }

    /// Requests served over a path
    pub fn path_count(&self, path: RoutePath) -> u64 {
        self.per_path[path_index(path)].get()
    }

    /// Counter snapshot
    pub fn counters(&self) -> RouterCounters {
        RouterCounters {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requests: self.requests.get(),
            served: self.served.get(),
            fallbacks: self.fallbacks.get(),
            exhausted: self.exhausted.get(),
            attempt_failures: self.attempt_failures.get(),
            attempt_timeouts: self.attempt_timeouts.get(),
            compliance_skips: self.compliance_skips.get(),
            circuit_rejections: self.circuit_rejections.get(),
            cancellations: self.cancellations.get(),
            in_flight: self.in_flight.get(),
            direct: self.path_count(RoutePath::Direct),
            brokered: self.path_count(RoutePath::Brokered),
            mean_latency_ms: self.latency.snapshot().mean(),
        }
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn class_index(class: TaskClass) -> usize {
    match class {
        TaskClass::Orchestration => 0,
        TaskClass::EndUser => 1,
        TaskClass::Audience => 2,
    }
}

fn path_index(path: RoutePath) -> usize {
    match path {
        RoutePath::Direct => 0,
        RoutePath::Brokered => 1,
    }
}

/// Counter values at a point in time
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCounters {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub served: u64,
    pub fallbacks: u64,
    pub exhausted: u64,
    pub attempt_failures: u64,
    pub attempt_timeouts: u64,
    pub compliance_skips: u64,
    pub circuit_rejections: u64,
    pub cancellations: u64,
    pub in_flight: u64,
    pub direct: u64,
    pub brokered: u64,
    pub mean_latency_ms: f64,
}

// ============================================================================
// Metrics Report
// ============================================================================

/// Per-provider line of a report
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    pub provider: String,
    pub enabled: bool,
    pub samples: usize,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub success_rate: f64,
    pub cost_per_request: f64,
    pub direct_circuit: CircuitState,
    pub brokered_circuit: CircuitState,
}

/// Burn rates of one operation class
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnRateMetrics {
    pub operation_class: OperationClass,
    pub short_horizon: f64,
    pub long_horizon: f64,
    pub status: SloStatus,
}

/// Periodic report pushed to the metrics sink
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub providers: Vec<ProviderMetrics>,
    pub burn_rates: Vec<BurnRateMetrics>,
    pub counters: RouterCounters,
}

impl MetricsReport {
    /// Collect a report from live router state
    pub fn collect(
        registry: &ProviderRegistry,
        circuits: &CircuitBreakerRegistry,
        telemetry: &LatencyTelemetry,
        metrics: &RouterMetrics,
    ) -> Self {
        let long_horizon = telemetry.config().slo.long_horizon;
        let since = telemetry
            .now_ms()
            .saturating_sub(long_horizon.as_millis() as u64);

        let providers = registry
            .entries()
            .iter()
            .map(|entry| {
                let id = &entry.identity.id;
                let stats = telemetry.provider_stats(id, since);
                ProviderMetrics {
                    provider: id.clone(),
                    enabled: entry.is_enabled(),
                    samples: stats.samples,
                    p95_ms: stats.p95_ms,
                    p99_ms: stats.p99_ms,
                    success_rate: stats.success_rate,
                    cost_per_request: stats.cost_per_request,
                    direct_circuit: circuits.state(id, RoutePath::Direct),
                    brokered_circuit: circuits.state(id, RoutePath::Brokered),
                }
            })
            .collect();

        let burn_rates = OperationClass::REAL
            .into_iter()
            .map(|class| {
                let (short, long) = telemetry.burn_rates(class);
                BurnRateMetrics {
                    operation_class: class,
                    short_horizon: short,
                    long_horizon: long,
                    status: telemetry.slo_status(class),
                }
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            providers,
            burn_rates,
            counters: metrics.counters(),
        }
    }

    /// Export as Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let c = &self.counters;
        let mut output = String::new();

        for (name, help, value) in [
            ("airouter_requests_total", "Requests received", c.requests),
            ("airouter_served_total", "Requests served", c.served),
            ("airouter_fallbacks_total", "Requests served by a fallback", c.fallbacks),
            ("airouter_exhausted_total", "Requests with no eligible provider", c.exhausted),
            ("airouter_compliance_skips_total", "Providers removed by compliance", c.compliance_skips),
            ("airouter_circuit_rejections_total", "Candidates refused by a circuit", c.circuit_rejections),
            ("airouter_cancellations_total", "Requests abandoned by the caller", c.cancellations),
        ] {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }

        output.push_str(&format!(
            "# HELP airouter_in_flight Requests in flight\n\
             # TYPE airouter_in_flight gauge\n\
             airouter_in_flight {}\n\n",
            c.in_flight
        ));

        output.push_str(
            "# HELP airouter_provider_latency_ms Provider latency percentiles\n\
             # TYPE airouter_provider_latency_ms gauge\n",
        );
        for p in &self.providers {
            output.push_str(&format!(
                "airouter_provider_latency_ms{{provider=\"{}\",quantile=\"0.95\"}} {}\n\
                 airouter_provider_latency_ms{{provider=\"{}\",quantile=\"0.99\"}} {}\n",
                p.provider, p.p95_ms, p.provider, p.p99_ms
            ));
        }
        output.push('\n');

        output.push_str(
            "# HELP airouter_circuit_open Circuit state (0 closed, 1 open, 2 half-open)\n\
             # TYPE airouter_circuit_open gauge\n",
        );
        for p in &self.providers {
            for (path, state) in [
                (RoutePath::Direct, p.direct_circuit),
                (RoutePath::Brokered, p.brokered_circuit),
            ] {
                let value = match state {
                    CircuitState::Closed => 0,
                    CircuitState::Open => 1,
                    CircuitState::HalfOpen => 2,
                };
                output.push_str(&format!(
                    "airouter_circuit_open{{provider=\"{}\",path=\"{path}\"}} {value}\n",
                    p.provider
                ));
            }
        }
        output.push('\n');

        output.push_str(
            "# HELP airouter_burn_rate SLO burn rate\n\
             # TYPE airouter_burn_rate gauge\n",
        );
        for b in &self.burn_rates {
            output.push_str(&format!(
                "airouter_burn_rate{{class=\"{}\",horizon=\"short\"}} {:.3}\n\
                 airouter_burn_rate{{class=\"{}\",horizon=\"long\"}} {:.3}\n",
                b.operation_class, b.short_horizon, b.operation_class, b.long_horizon
            ));
        }

        output
    }
}
