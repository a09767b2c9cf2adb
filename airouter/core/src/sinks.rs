//! Audit and Metrics Sinks
//!
//! Both sinks are fire-and-forget from the router's perspective: `emit` and
//! `publish` are synchronous, must not block, and have no failure path. A
//! slow or unavailable downstream loses events rather than stalling routing.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::routing::metrics::MetricsReport;

// ============================================================================
// Audit Events
// ============================================================================

/// Kind of audit event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A request reached a terminal outcome
    RoutingDecision,
    /// One attempt in a fallback chain failed
    AttemptFailed,
    /// A provider was skipped by the compliance gate
    ComplianceSkipped,
    /// A circuit changed state
    CircuitTransition,
    /// A routing rule version was swapped in
    RuleSwapped,
    /// A routing rule was reverted to its previous version
    RuleRolledBack,
    /// The optimizer produced a recommendation
    OptimizerRecommendation,
    /// The optimizer confirmed an applied recommendation
    OptimizerConfirmed,
    /// The optimizer skipped a cycle
    OptimizerSkipped,
    /// SLO burn rate crossed a threshold
    SloErosion,
    /// Health monitor flagged a bottleneck provider
    BottleneckFlagged,
}

impl AuditEventType {
    /// Stable snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoutingDecision => "routing_decision",
            Self::AttemptFailed => "attempt_failed",
            Self::ComplianceSkipped => "compliance_skipped",
            Self::CircuitTransition => "circuit_transition",
            Self::RuleSwapped => "rule_swapped",
            Self::RuleRolledBack => "rule_rolled_back",
            Self::OptimizerRecommendation => "optimizer_recommendation",
            Self::OptimizerConfirmed => "optimizer_confirmed",
            Self::OptimizerSkipped => "optimizer_skipped",
            Self::SloErosion => "slo_erosion",
            Self::BottleneckFlagged => "bottleneck_flagged",
        }
    }
}

/// Structured audit event `{timestamp, type, payload}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    /// Event-specific body
    pub payload: serde_json::Value,
}

impl AuditEvent {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn new(event_type: AuditEventType, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            payload,
        }
    }
}

/// Audit event consumer
pub trait AuditSink: Send + Sync {
    /// Hand off an event. Must not block.
    fn emit(&self, event: AuditEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Writes events to the `airouter::audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "airouter::audit",
            event_type = event.event_type.as_str(),
            timestamp = %event.timestamp,
            payload = %event.payload,
            "audit"
        );
    }
}

/// Forwards events into a bounded channel, dropping on overflow
#[derive(Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    /// Create a sink and the receiving end of its channel
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                tracing::warn!(dropped, "Audit channel saturated, dropping events");
            }
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Metrics report consumer
pub trait MetricsSink: Send + Sync {
    /// Hand off a report. Must not block.
    fn publish(&self, report: MetricsReport);
}

/// Discards every report
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn publish(&self, _report: MetricsReport) {}
}

/// Logs a one-line summary per provider
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn publish(&self, report: MetricsReport) {
        for provider in &report.providers {
            tracing::info!(
                target: "airouter::metrics",
                provider = %provider.provider,
                p95_ms = provider.p95_ms,
                p99_ms = provider.p99_ms,
                success_rate = provider.success_rate,
                direct = %provider.direct_circuit,
                brokered = %provider.brokered_circuit,
                "provider metrics"
            );
        }
        for burn in &report.burn_rates {
            tracing::debug!(
                target: "airouter::metrics",
                operation_class = %burn.operation_class,
                short = burn.short_horizon,
                long = burn.long_horizon,
                "burn rate"
            );
        }
    }
}
